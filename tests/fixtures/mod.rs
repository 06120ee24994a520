//! Localhost fixtures for integration testing
//!
//! - [`ServerFixture`]: a running dnsd server with a UDP client socket
//! - [`SecondaryFixture`]: a TCP peer answering NOTIFY with the dnsd query
//!   layer, standing in for a secondary server
//!
//! # Example
//!
//! ```no_run
//! use dnsd_core::wire::rtype;
//! use dnsd_integration_tests::fixtures::{ServerFixture, example_zones};
//!
//! let server = ServerFixture::start(example_zones(1), 2).unwrap();
//! let reply = server.query(1, "www.example.com", rtype::A).unwrap();
//! assert!(reply.len() > 12);
//! server.stop();
//! ```

use dnsd_core::wire::{CLASS_IN, Record, Soa, rtype};
use dnsd_core::{
    Arena, Layer, LayerFlags, Name, PacketWriter, QueryHandler, QueryParams, Responder, Transport,
    Zone, ZoneSet, handle_query,
};
use dnsd_transport::{Server, ServerConfig, ServerHandle, ServerStats, TransportError};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Apex of the zone served by the fixtures
pub const EXAMPLE_APEX: &str = "example.com";

/// Address of `www.example.com` in [`example_zones`]
pub const WWW_ADDR: [u8; 4] = [192, 0, 2, 80];

/// SOA of the example zone with `serial`
pub fn example_soa(serial: u32) -> Soa {
    Soa {
        mname: Name::from_ascii("ns1.example.com").unwrap(),
        rname: Name::from_ascii("hostmaster.example.com").unwrap(),
        serial,
        refresh: 3600,
        retry: 600,
        expire: 604_800,
        minimum: 300,
    }
}

/// The example zone: SOA, NS, one A and one TXT record
pub fn example_zone(serial: u32) -> Zone {
    let apex = Name::from_ascii(EXAMPLE_APEX).unwrap();
    let mut zone = Zone::new(apex.clone(), example_soa(serial), 3600);
    zone.add_record(Record::new(
        apex,
        rtype::NS,
        3600,
        Name::from_ascii("ns1.example.com").unwrap().as_wire().to_vec(),
    ))
    .unwrap();
    zone.add_record(Record::new(
        Name::from_ascii("www.example.com").unwrap(),
        rtype::A,
        300,
        WWW_ADDR.to_vec(),
    ))
    .unwrap();
    zone.add_record(Record::new(
        Name::from_ascii("txt.example.com").unwrap(),
        rtype::TXT,
        300,
        b"\x05hello".to_vec(),
    ))
    .unwrap();
    zone
}

/// Zone set holding only [`example_zone`]
pub fn example_zones(serial: u32) -> ZoneSet {
    let mut zones = ZoneSet::new();
    zones.insert(Arc::new(example_zone(serial)));
    zones
}

/// Standard query with RD set
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    let mut w = PacketWriter::new(&mut buf);
    w.set_id(id);
    w.set_rd(true);
    w.put_question(Name::from_ascii(name).unwrap().as_wire(), CLASS_IN, qtype)
        .unwrap();
    w.wire().to_vec()
}

/// A dnsd server on `127.0.0.1` with a client socket pointed at it
pub struct ServerFixture {
    handle: Option<ServerHandle>,
    client: UdpSocket,
    /// UDP address of the server
    pub addr: SocketAddr,
}

impl ServerFixture {
    /// Serve `zones` with `workers` UDP workers
    pub fn start(zones: ZoneSet, workers: usize) -> Result<Self, TransportError> {
        Self::with_config(
            Arc::new(zones),
            ServerConfig {
                listen: vec!["127.0.0.1:0".parse().unwrap()],
                udp_workers: workers,
                ..ServerConfig::default()
            },
        )
    }

    /// Serve `responder` with an explicit configuration
    pub fn with_config(
        responder: Arc<dyn Responder>,
        config: ServerConfig,
    ) -> Result<Self, TransportError> {
        let server = Server::bind(config)?;
        let addr = server
            .local_addrs()
            .first()
            .copied()
            .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        let handle = server.start(responder)?;

        let client = UdpSocket::bind("127.0.0.1:0")?;
        client.set_read_timeout(Some(crate::test_helpers::ci_timeout(Duration::from_secs(2))))?;
        Ok(Self {
            handle: Some(handle),
            client,
            addr,
        })
    }

    /// Running server
    pub fn handle(&self) -> &ServerHandle {
        self.handle.as_ref().unwrap()
    }

    /// Send raw bytes to the server
    pub fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        self.client.send_to(bytes, self.addr).map(|_| ())
    }

    /// Receive one datagram (errors with `WouldBlock`/`TimedOut` when silent)
    pub fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 65535];
        let (n, _) = self.client.recv_from(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Send a query and wait for its reply
    pub fn query(&self, id: u16, name: &str, qtype: u16) -> io::Result<Vec<u8>> {
        self.send_raw(&build_query(id, name, qtype))?;
        self.recv()
    }

    /// Stop the workers and return their counters
    pub fn stop(mut self) -> Arc<ServerStats> {
        self.handle.take().unwrap().stop()
    }
}

/// A TCP peer that answers NOTIFY through the dnsd query layer
pub struct SecondaryFixture {
    /// Address to send NOTIFY to
    pub addr: SocketAddr,
    received: Arc<AtomicUsize>,
}

impl SecondaryFixture {
    /// Accept NOTIFY for the zones in `zones`
    pub fn start(zones: ZoneSet) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let received = Arc::new(AtomicUsize::new(0));
        let responder: Arc<dyn Responder> = Arc::new(zones);

        let counter = Arc::clone(&received);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let responder = Arc::clone(&responder);
                let counter = Arc::clone(&counter);
                thread::spawn(move || serve_stream(stream, responder, counter));
            }
        });

        Ok(Self { addr, received })
    }

    /// Messages answered so far
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

fn serve_stream(mut stream: TcpStream, responder: Arc<dyn Responder>, counter: Arc<AtomicUsize>) {
    let remote = stream
        .peer_addr()
        .unwrap_or_else(|_| "127.0.0.1:0".parse().unwrap());
    let mut layer = Layer::new(QueryHandler::new(responder), Arena::with_capacity(16 * 1024));
    let mut reply = vec![0u8; 65535];

    loop {
        let mut prefix = [0u8; 2];
        if stream.read_exact(&mut prefix).is_err() {
            return;
        }
        let mut query = vec![0u8; u16::from_be_bytes(prefix) as usize];
        if stream.read_exact(&mut query).is_err() {
            return;
        }

        let params = QueryParams {
            flags: LayerFlags::new(),
            transport: Transport::Tcp,
            ..QueryParams::udp(remote, 0)
        };
        let len = handle_query(&mut layer, params, &query, &mut reply);
        counter.fetch_add(1, Ordering::SeqCst);
        if len == 0 {
            continue;
        }
        let sent = stream
            .write_all(&(len as u16).to_be_bytes())
            .and_then(|()| stream.write_all(&reply[..len]));
        if sent.is_err() {
            return;
        }
    }
}
