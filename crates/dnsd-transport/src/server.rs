//! Listening sockets and the worker set.

use crate::backend::pktinfo::enable_pktinfo;
use crate::error::TransportError;
use crate::handler::UdpContext;
use crate::iface::{IfaceDescriptor, ThreadPartition, thread_fds};
use crate::quic::QuicConfig;
use crate::worker::{Role, ServerStats, WorkerSpec, WorkerStats, udp_master};
use crate::xdp::{UmemConfig, XdpError, XdpRing};
use dnsd_core::{MAX_UDP_PAYLOAD, Responder};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// XDP interface and the number of queues to serve on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdpInterface {
    /// Interface name
    pub name: String,
    /// Queue count; one XDP worker per queue
    pub queues: usize,
    /// Pinned `XSKMAP` the sockets register in, if the redirect program uses one
    pub xsks_map: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain UDP listening addresses
    pub listen: Vec<SocketAddr>,
    /// QUIC listening addresses
    pub quic_listen: Vec<SocketAddr>,
    /// UDP workers (0 = one per core)
    pub udp_workers: usize,
    /// QUIC workers
    pub quic_workers: usize,
    /// One socket per worker with SO_REUSEPORT
    pub reuseport: bool,
    /// XDP interfaces
    pub xdp: Vec<XdpInterface>,
    /// Frame area of each XDP ring
    pub umem: UmemConfig,
    /// Largest UDP reply
    pub max_udp_payload: u16,
    /// QUIC settings
    pub quic: QuicConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            quic_listen: Vec::new(),
            udp_workers: 0,
            quic_workers: 1,
            reuseport: cfg!(target_os = "linux"),
            xdp: Vec::new(),
            umem: UmemConfig::default(),
            max_udp_payload: MAX_UDP_PAYLOAD,
            quic: QuicConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.listen.is_empty() && self.quic_listen.is_empty() && self.xdp.is_empty() {
            return Err(TransportError::InvalidConfig(
                "no listening address or XDP interface".into(),
            ));
        }
        if !self.quic_listen.is_empty() && self.quic_workers == 0 {
            return Err(TransportError::InvalidConfig(
                "QUIC listening addresses need quic_workers > 0".into(),
            ));
        }
        // Each QUIC worker keeps its own connection table, so workers must
        // not share a socket.
        if !self.quic_listen.is_empty() && !self.reuseport && self.quic_workers > 1 {
            return Err(TransportError::InvalidConfig(format!(
                "{} QUIC workers need reuseport; use one worker without it",
                self.quic_workers
            )));
        }
        if self.max_udp_payload < 512 {
            return Err(TransportError::InvalidConfig(format!(
                "max_udp_payload {} below 512",
                self.max_udp_payload
            )));
        }
        if let Some(iface) = self.xdp.iter().find(|i| i.queues == 0) {
            return Err(TransportError::InvalidConfig(format!(
                "XDP interface {} has no queues",
                iface.name
            )));
        }
        if self.quic.table.buckets == 0 {
            return Err(TransportError::InvalidConfig(
                "QUIC table needs at least one bucket".into(),
            ));
        }
        self.umem
            .validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))
    }

    /// Effective UDP worker count
    pub fn udp_threads(&self) -> usize {
        if self.udp_workers == 0 {
            num_cpus::get()
        } else {
            self.udp_workers
        }
    }
}

struct Listener {
    addr: SocketAddr,
    sockets: Vec<Socket>,
}

impl Listener {
    fn fds(&self) -> Vec<RawFd> {
        self.sockets.iter().map(|s| s.as_raw_fd()).collect()
    }
}

fn bind_socket(addr: SocketAddr, reuseport: bool) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    #[cfg(unix)]
    if reuseport {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Failed to set receive buffer on {}: {}", addr, e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Failed to set send buffer on {}: {}", addr, e);
    }
    enable_pktinfo(socket.as_raw_fd(), addr.is_ipv6())?;
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::BindFailed { addr, source })?;
    Ok(socket)
}

/// Bind `count` sockets to `addr`, or one when `reuseport` is off.
///
/// A zero port is resolved by the first bind and reused for the rest.
fn bind_listener(addr: SocketAddr, count: usize, reuseport: bool) -> Result<Listener, TransportError> {
    let count = if reuseport { count.max(1) } else { 1 };
    let first = bind_socket(addr, reuseport)?;
    let bound = first
        .local_addr()?
        .as_socket()
        .ok_or_else(|| TransportError::InvalidConfig(format!("{addr} is not an IP address")))?;

    let mut sockets = vec![first];
    for _ in 1..count {
        sockets.push(bind_socket(bound, reuseport)?);
    }
    Ok(Listener {
        addr: bound,
        sockets,
    })
}

/// Bound sockets and rings, ready to start workers
pub struct Server {
    config: ServerConfig,
    udp: Vec<Listener>,
    quic: Vec<Listener>,
    rings: Vec<Box<dyn XdpRing>>,
}

#[cfg(target_os = "linux")]
fn open_xdp(
    name: &str,
    queue: u32,
    umem: &UmemConfig,
    xsks_map: Option<&Path>,
) -> Result<Box<dyn XdpRing>, XdpError> {
    let ring = crate::xdp::AfXdpRing::open(name, queue, umem.clone(), xsks_map)?;
    Ok(Box::new(ring))
}

#[cfg(not(target_os = "linux"))]
fn open_xdp(
    _name: &str,
    _queue: u32,
    _umem: &UmemConfig,
    _xsks_map: Option<&Path>,
) -> Result<Box<dyn XdpRing>, XdpError> {
    Err(XdpError::Unsupported)
}

impl Server {
    /// Bind every configured address and open an XDP socket per interface queue
    pub fn bind(config: ServerConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let udp_threads = config.udp_threads();
        let udp = config
            .listen
            .iter()
            .map(|&addr| bind_listener(addr, udp_threads, config.reuseport))
            .collect::<Result<Vec<_>, _>>()?;
        let quic = config
            .quic_listen
            .iter()
            .map(|&addr| bind_listener(addr, config.quic_workers, config.reuseport))
            .collect::<Result<Vec<_>, _>>()?;

        for l in &udp {
            info!("Listening on {} ({} sockets)", l.addr, l.sockets.len());
        }
        for l in &quic {
            info!("Listening on {} for QUIC ({} sockets)", l.addr, l.sockets.len());
        }

        let mut server = Self {
            config,
            udp,
            quic,
            rings: Vec::new(),
        };
        for iface in server.config.xdp.clone() {
            for queue in 0..iface.queues as u32 {
                let ring = open_xdp(&iface.name, queue, &server.config.umem, iface.xsks_map.as_deref())
                    .map_err(|e| TransportError::BackendInit(format!("{}/{}: {}", iface.name, queue, e)))?;
                server.attach_xdp(ring);
            }
        }
        Ok(server)
    }

    /// Add a ring served by one more XDP worker.
    ///
    /// Rings not opened from the configuration, such as an in-process
    /// [`UmemRing`](crate::xdp::UmemRing), join the same way.
    pub fn attach_xdp(&mut self, ring: Box<dyn XdpRing>) {
        self.rings.push(ring);
    }

    /// Actual UDP listening addresses
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.udp.iter().map(|l| l.addr).collect()
    }

    /// Actual QUIC listening addresses
    pub fn quic_addrs(&self) -> Vec<SocketAddr> {
        self.quic.iter().map(|l| l.addr).collect()
    }

    /// Worker layout this server will start with
    pub fn partition(&self) -> ThreadPartition {
        ThreadPartition {
            udp: if self.udp.is_empty() {
                0
            } else {
                self.config.udp_threads()
            },
            xdp: self.rings.len(),
            quic: if self.quic.is_empty() {
                0
            } else {
                self.config.quic_workers
            },
        }
    }

    fn descriptors(&self, partition: &ThreadPartition) -> Vec<IfaceDescriptor> {
        let udp = self.udp.iter().map(|l| IfaceDescriptor {
            udp_fds: l.fds(),
            ..IfaceDescriptor::default()
        });
        let quic = self.quic.iter().map(|l| IfaceDescriptor {
            quic_fds: l.fds(),
            quic_first_thread_id: partition.range(Role::Quic).start,
            quic_threads: partition.quic,
            ..IfaceDescriptor::default()
        });
        let xdp = (!self.rings.is_empty()).then(|| IfaceDescriptor {
            xdp_fds: self.rings.iter().map(|r| r.fd()).collect(),
            xdp_first_thread_id: partition.range(Role::Xdp).start,
            ..IfaceDescriptor::default()
        });
        udp.chain(quic).chain(xdp).collect()
    }

    /// Spawn the workers
    pub fn start(self, responder: Arc<dyn Responder>) -> Result<ServerHandle, TransportError> {
        let partition = self.partition();
        if partition.total() == 0 {
            return Err(TransportError::InvalidConfig("no workers to start".into()));
        }
        let ifaces = self.descriptors(&partition);
        let cancel = Arc::new(AtomicBool::new(false));

        let Server {
            config,
            udp,
            quic,
            rings,
        } = self;

        let mut handle = ServerHandle {
            threads: Vec::with_capacity(partition.total()),
            cancel: Arc::clone(&cancel),
            stats: Arc::new(ServerStats::new(Vec::new())),
            local_addrs: udp.iter().map(|l| l.addr).collect(),
            quic_addrs: quic.iter().map(|l| l.addr).collect(),
            _sockets: udp.into_iter().chain(quic).collect(),
        };

        let mut rings = rings.into_iter();
        let mut all_stats = Vec::with_capacity(partition.total());
        for thread_id in 0..partition.total() {
            let Some(role) = partition.role_of(thread_id) else {
                break;
            };
            let ring = if role == Role::Xdp { rings.next() } else { None };
            let fds = match &ring {
                Some(ring) => vec![ring.fd()],
                None => thread_fds(&ifaces, thread_id, role, config.reuseport),
            };
            let spec = WorkerSpec::new(thread_id, role, fds, ring);

            let stats = Arc::new(WorkerStats::default());
            all_stats.push(Arc::clone(&stats));
            let ctx = UdpContext::new(
                Arc::clone(&responder),
                thread_id,
                config.max_udp_payload,
                stats,
            );
            let quic = config.quic.clone();
            let cancel = Arc::clone(&cancel);

            let spawned = thread::Builder::new()
                .name(format!("dnsd-{}-{}", role.to_string().to_lowercase(), thread_id))
                .spawn(move || udp_master(spec, ctx, quic, cancel));
            match spawned {
                Ok(thread) => handle.threads.push(thread),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", thread_id, e);
                    handle.shutdown();
                    return Err(TransportError::Spawn(e));
                }
            }
        }

        handle.stats = Arc::new(ServerStats::new(all_stats));
        info!(
            "Started {} workers ({} UDP, {} XDP, {} QUIC)",
            partition.total(),
            partition.udp,
            partition.xdp,
            partition.quic
        );
        Ok(handle)
    }
}

/// Running server
pub struct ServerHandle {
    threads: Vec<JoinHandle<Result<(), TransportError>>>,
    cancel: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    local_addrs: Vec<SocketAddr>,
    quic_addrs: Vec<SocketAddr>,
    // Closed only after the workers are joined.
    _sockets: Vec<Listener>,
}

impl ServerHandle {
    /// Actual UDP listening addresses
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Actual QUIC listening addresses
    pub fn quic_addrs(&self) -> &[SocketAddr] {
        &self.quic_addrs
    }

    /// Live counters
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Flag the workers poll for cancellation
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Number of running workers
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} failed: {}", name, e),
                Err(_) => error!("{} panicked", name),
            }
        }
    }

    /// Cancel the workers, wait for them and return the final counters
    pub fn stop(mut self) -> Arc<ServerStats> {
        self.shutdown();
        info!(
            "Server stopped (received {}, sent {}, dropped {}, errors {})",
            self.stats.total_received(),
            self.stats.total_sent(),
            self.stats.total_dropped(),
            self.stats.total_errors()
        );
        Arc::clone(&self.stats)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            warn!("Server handle dropped while running, stopping workers");
            self.shutdown();
        }
    }
}
