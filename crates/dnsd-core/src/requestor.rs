//! Outbound single-exchange driver.
//!
//! A [`Requestor`] runs a [`Layer`] in the client role: `begin`, then produce
//! the request and send it, receive the reply and consume it, repeating while
//! the handler asks for more, all within one wall-clock deadline. TCP is the
//! default transport (two-byte length framing); idle TCP connections can be
//! kept in a shared [`ConnectionPool`] and are marked `REUSED` when picked up
//! again.

use crate::arena::Arena;
use crate::error::{Reply, RequestError, WireError};
use crate::layer::{Layer, LayerFlags, LayerHandler, LayerState};
use crate::wire::{MAX_PKTSIZE, Packet, PacketWriter, names_equal};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Request transport flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags(u8);

impl RequestFlags {
    /// Use UDP instead of TCP
    pub const UDP: u8 = 0b0000_0001;
    /// Use TCP Fast Open for new connections
    pub const TFO: u8 = 0b0000_0010;

    /// Create empty flags (TCP, no fast open)
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Add UDP flag
    #[must_use]
    pub fn with_udp(mut self) -> Self {
        self.0 |= Self::UDP;
        self
    }

    /// Add TFO flag
    #[must_use]
    pub fn with_tfo(mut self) -> Self {
        self.0 |= Self::TFO;
        self
    }

    /// Check if UDP is requested
    #[must_use]
    pub fn is_udp(self) -> bool {
        self.0 & Self::UDP != 0
    }

    /// Check if TCP Fast Open is requested
    #[must_use]
    pub fn is_tfo(self) -> bool {
        self.0 & Self::TFO != 0
    }
}

/// Where and how to send one request
#[derive(Debug, Clone)]
pub struct Request {
    /// Remote address
    pub remote: SocketAddr,
    /// Local source address to bind, if any
    pub source: Option<SocketAddr>,
    /// Transport flags
    pub flags: RequestFlags,
    /// Signing key name, carried for the signing layer
    pub key: Option<String>,
    /// Deadline for the whole exchange
    pub timeout: Duration,
}

impl Request {
    /// TCP request to `remote` with the given timeout
    pub fn new(remote: SocketAddr, timeout: Duration) -> Self {
        Self {
            remote,
            source: None,
            flags: RequestFlags::new(),
            key: None,
            timeout,
        }
    }
}

type PoolKey = (SocketAddr, Option<SocketAddr>);

/// Idle outbound TCP connections shared between requestors
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<TcpStream>>>,
    max_per_remote: usize,
}

impl ConnectionPool {
    /// Create a pool keeping at most `max_per_remote` idle connections per
    /// remote/source pair
    pub fn new(max_per_remote: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_per_remote,
        }
    }

    /// Take an idle connection
    pub fn take(&self, remote: SocketAddr, source: Option<SocketAddr>) -> Option<TcpStream> {
        let mut idle = self.idle.lock().ok()?;
        let list = idle.get_mut(&(remote, source))?;
        let stream = list.pop();
        if list.is_empty() {
            idle.remove(&(remote, source));
        }
        stream
    }

    /// Return a connection after a successful exchange
    pub fn put(&self, remote: SocketAddr, source: Option<SocketAddr>, stream: TcpStream) {
        if let Ok(mut idle) = self.idle.lock() {
            let list = idle.entry((remote, source)).or_default();
            if list.len() < self.max_per_remote {
                list.push(stream);
            }
        }
    }

    /// Number of idle connections
    pub fn len(&self) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Whether the pool holds no connection
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every idle connection
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(4)
    }
}

enum Connection {
    Tcp { stream: TcpStream, reused: bool },
    Udp(UdpSocket),
}

impl Connection {
    fn reused(&self) -> bool {
        matches!(self, Self::Tcp { reused: true, .. })
    }
}

fn remaining(deadline: Instant) -> Result<Duration, RequestError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(RequestError::Timeout);
    }
    Ok(left)
}

fn classify(err: io::Error, wrap: fn(io::Error) -> RequestError) -> RequestError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RequestError::Timeout,
        io::ErrorKind::UnexpectedEof => RequestError::Closed,
        _ => wrap(err),
    }
}

fn open_socket(request: &Request, ty: Type, protocol: Protocol) -> Result<Socket, RequestError> {
    let socket = Socket::new(Domain::for_address(request.remote), ty, Some(protocol))
        .map_err(RequestError::Connect)?;
    if let Some(source) = request.source {
        socket
            .bind(&SockAddr::from(source))
            .map_err(RequestError::Connect)?;
    }
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn enable_fastopen(socket: &Socket) {
    use std::os::fd::AsRawFd;

    let on: libc::c_int = 1;
    // SAFETY: valid socket fd, option value points to a live c_int of the
    // advertised length.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        debug!(error = %io::Error::last_os_error(), "TCP fast open unavailable");
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_fastopen(_socket: &Socket) {}

/// Drives a [`Layer`] through one outbound exchange at a time
pub struct Requestor<H: LayerHandler> {
    layer: Layer<H>,
    pool: Option<Arc<ConnectionPool>>,
    query_buf: Vec<u8>,
    reply_buf: Vec<u8>,
}

impl<H: LayerHandler> Requestor<H>
where
    H::Params: Clone,
{
    /// Create a requestor around `handler`
    pub fn new(handler: H, arena: Arena) -> Self {
        Self {
            layer: Layer::new(handler, arena),
            pool: None,
            query_buf: vec![0u8; MAX_PKTSIZE],
            reply_buf: vec![0u8; MAX_PKTSIZE],
        }
    }

    /// Keep idle TCP connections in `pool`
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Underlying layer
    pub fn layer(&self) -> &Layer<H> {
        &self.layer
    }

    /// Underlying handler
    pub fn handler(&self) -> &H {
        self.layer.handler()
    }

    /// Perform one exchange.
    ///
    /// A pooled connection that breaks at the transport level is discarded and
    /// the exchange is retried once on a fresh connection.
    pub fn exec(&mut self, request: &Request, params: H::Params) -> Result<Reply, RequestError> {
        let deadline = Instant::now() + request.timeout;

        let conn = self.connect(request, deadline)?;
        let reused = conn.reused();
        let result = self.run(request, conn, params.clone(), deadline);

        match result {
            Err(err) if reused && err.is_transport() => {
                debug!(remote = %request.remote, error = %err, "pooled connection failed, reconnecting");
                let conn = self.open(request, deadline)?;
                self.run(request, conn, params, deadline)
            }
            other => other,
        }
    }

    fn connect(&self, request: &Request, deadline: Instant) -> Result<Connection, RequestError> {
        if !request.flags.is_udp() {
            if let Some(stream) = self
                .pool
                .as_ref()
                .and_then(|pool| pool.take(request.remote, request.source))
            {
                return Ok(Connection::Tcp {
                    stream,
                    reused: true,
                });
            }
        }
        self.open(request, deadline)
    }

    fn open(&self, request: &Request, deadline: Instant) -> Result<Connection, RequestError> {
        let remote = SockAddr::from(request.remote);

        if request.flags.is_udp() {
            let socket = open_socket(request, Type::DGRAM, Protocol::UDP)?;
            socket.connect(&remote).map_err(RequestError::Connect)?;
            return Ok(Connection::Udp(socket.into()));
        }

        let socket = open_socket(request, Type::STREAM, Protocol::TCP)?;
        if request.flags.is_tfo() {
            enable_fastopen(&socket);
        }
        socket
            .connect_timeout(&remote, remaining(deadline)?)
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RequestError::Timeout,
                _ => RequestError::Connect(e),
            })?;
        socket.set_tcp_nodelay(true).map_err(RequestError::Connect)?;

        Ok(Connection::Tcp {
            stream: socket.into(),
            reused: false,
        })
    }

    fn run(
        &mut self,
        request: &Request,
        mut conn: Connection,
        params: H::Params,
        deadline: Instant,
    ) -> Result<Reply, RequestError> {
        let reused = conn.reused();
        let mut flags = LayerFlags::new();
        if reused {
            flags.insert(LayerFlags::REUSED);
        }
        self.layer.set_flags(flags);
        self.layer.begin(params);

        let result = self.drive(&mut conn, deadline, reused);
        self.layer.finish();

        if result.is_ok() {
            if let (Connection::Tcp { stream, .. }, Some(pool)) = (conn, self.pool.as_ref()) {
                pool.put(request.remote, request.source, stream);
            }
        }
        result
    }

    fn drive(
        &mut self,
        conn: &mut Connection,
        deadline: Instant,
        reused: bool,
    ) -> Result<Reply, RequestError> {
        let mut query_len = 0;
        let mut reply = None;

        loop {
            match self.layer.state() {
                LayerState::Produce => {
                    let mut out = PacketWriter::new(&mut self.query_buf);
                    if self.layer.produce(&mut out) == LayerState::Fail {
                        return Err(RequestError::LayerFailed);
                    }
                    query_len = out.size();
                    send(conn, &self.query_buf[..query_len], deadline)?;
                }
                LayerState::Consume => {
                    let len = recv(conn, &mut self.reply_buf, deadline)?;
                    let query = &self.query_buf[..query_len];
                    let answer = &self.reply_buf[..len];

                    let arena = self.layer.arena_mut();
                    let mut sent = Packet::new(query);
                    sent.parse(arena).map_err(RequestError::Build)?;
                    let mut pkt = Packet::new(answer);
                    pkt.parse(arena)?;
                    if !matches_query(&sent, &pkt, arena) {
                        return Err(RequestError::Mismatch);
                    }

                    reply = Some(Reply {
                        rcode: pkt.ext_rcode(),
                        size: len,
                        reused,
                    });
                    self.layer.consume(&pkt);
                }
                LayerState::Done => {
                    return reply.ok_or(RequestError::LayerFailed);
                }
                LayerState::Begin | LayerState::Fail | LayerState::Noop => {
                    return Err(RequestError::LayerFailed);
                }
            }
        }
    }
}

fn matches_query(sent: &Packet<'_>, reply: &Packet<'_>, arena: &Arena) -> bool {
    if sent.id() != reply.id() || !reply.qr() {
        return false;
    }
    // Some servers leave the question out of error replies
    let (Some(q), Some(r)) = (sent.question(), reply.question()) else {
        return true;
    };
    let names = arena.get(q.qname).zip(arena.get(r.qname));
    q.qtype == r.qtype
        && q.qclass == r.qclass
        && names.is_some_and(|(a, b)| names_equal(a, b))
}

fn send(conn: &mut Connection, msg: &[u8], deadline: Instant) -> Result<(), RequestError> {
    match conn {
        Connection::Tcp { stream, .. } => {
            stream
                .set_write_timeout(Some(remaining(deadline)?))
                .map_err(RequestError::Send)?;
            let len = u16::try_from(msg.len()).map_err(|_| RequestError::Build(WireError::NoSpace))?;
            let mut framed = Vec::with_capacity(msg.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(msg);
            stream
                .write_all(&framed)
                .map_err(|e| classify(e, RequestError::Send))
        }
        Connection::Udp(socket) => {
            socket
                .set_write_timeout(Some(remaining(deadline)?))
                .map_err(RequestError::Send)?;
            socket
                .send(msg)
                .map(|_| ())
                .map_err(|e| classify(e, RequestError::Send))
        }
    }
}

fn recv(conn: &mut Connection, buf: &mut [u8], deadline: Instant) -> Result<usize, RequestError> {
    match conn {
        Connection::Tcp { stream, .. } => {
            stream
                .set_read_timeout(Some(remaining(deadline)?))
                .map_err(RequestError::Receive)?;
            let mut prefix = [0u8; 2];
            stream
                .read_exact(&mut prefix)
                .map_err(|e| classify(e, RequestError::Receive))?;
            let len = usize::from(u16::from_be_bytes(prefix));
            if len == 0 || len > buf.len() {
                return Err(RequestError::Closed);
            }
            stream
                .set_read_timeout(Some(remaining(deadline)?))
                .map_err(RequestError::Receive)?;
            stream
                .read_exact(&mut buf[..len])
                .map_err(|e| classify(e, RequestError::Receive))?;
            Ok(len)
        }
        Connection::Udp(socket) => {
            socket
                .set_read_timeout(Some(remaining(deadline)?))
                .map_err(RequestError::Receive)?;
            socket
                .recv(buf)
                .map_err(|e| classify(e, RequestError::Receive))
        }
    }
}
