//! QUIC datagram demultiplexing.
//!
//! Each QUIC worker owns one socket and one [`ConnTable`]. A received
//! datagram is classified from its invariant header only: unknown versions
//! get a Version Negotiation reply, datagrams for a known connection go to
//! that connection, and an unknown connection id is accepted only when the
//! datagram is a well-formed Initial. Everything else is dropped.
//!
//! An accepted connection is stored under the identifier this server chose
//! for it, which is what short-header packets carry. The client's original
//! destination id is kept as an alias so retransmitted Initials still find
//! the connection, and is retired once the client addresses the server id.
//!
//! The per-connection protocol engine (handshake, streams, loss recovery)
//! plugs in behind [`QuicConn::recv`].

pub mod packet;
pub mod table;

pub use packet::{
    LongType, MIN_INITIAL_DCID_LEN, MIN_INITIAL_SIZE, QUIC_V1, QUIC_V2, SUPPORTED_VERSIONS,
    VersionCid, accept_initial, decode_version_cid, write_version_negotiation,
};
pub use table::{
    ConnTable, ConnectionId, DEFAULT_BUCKETS, MAX_CID_LEN, SERVER_CID_LEN, TableConfig, cid_hash,
};

use crate::backend::Recvfrom;
use crate::error::TransportError;
use crate::handler::UdpContext;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Largest Version Negotiation packet: two 255-byte ids plus the version list
const MAX_VN_LEN: usize = 1 + 4 + 1 + 255 + 1 + 255 + 4 * SUPPORTED_VERSIONS.len();

/// QUIC listener configuration
#[derive(Debug, Clone, Default)]
pub struct QuicConfig {
    /// Certificate chain file
    pub cert_file: Option<PathBuf>,
    /// Private key file
    pub key_file: Option<PathBuf>,
    /// Connection table sizing and policy
    pub table: TableConfig,
}

/// Server certificate and key locations, checked to exist
#[derive(Debug, Clone)]
pub struct Credentials {
    cert: PathBuf,
    key: PathBuf,
}

impl Credentials {
    /// Resolve the configured credentials.
    ///
    /// Returns `Ok(None)` when nothing is configured or a file is missing;
    /// the listener then refuses new connections. Configuring only one of
    /// the two files is an error.
    pub fn load(config: &QuicConfig) -> Result<Option<Self>, TransportError> {
        match (&config.cert_file, &config.key_file) {
            (None, None) => {
                info!("QUIC credentials not configured, new connections refused");
                Ok(None)
            }
            (Some(cert), Some(key)) => {
                for path in [cert, key] {
                    if !path.is_file() {
                        warn!("QUIC credential file {} not found", path.display());
                        return Ok(None);
                    }
                }
                Ok(Some(Self {
                    cert: cert.clone(),
                    key: key.clone(),
                }))
            }
            _ => Err(TransportError::InvalidConfig(
                "QUIC certificate and key must be configured together".into(),
            )),
        }
    }

    /// Certificate chain file
    pub fn cert(&self) -> &Path {
        &self.cert
    }

    /// Private key file
    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// State of one QUIC connection
#[derive(Debug, Clone)]
pub struct QuicConn {
    scid: ConnectionId,
    original_dcid: ConnectionId,
    peer: SocketAddr,
    version: u32,
    confirmed: bool,
    packets: u64,
    bytes: u64,
}

impl QuicConn {
    fn new(original_dcid: ConnectionId, peer: SocketAddr, version: u32) -> Self {
        Self {
            scid: ConnectionId::random(),
            original_dcid,
            peer,
            version,
            confirmed: false,
            packets: 0,
            bytes: 0,
        }
    }

    /// Note that the peer addressed `dcid`. The first time that is the
    /// server id, returns the original destination id, which is no longer
    /// needed for routing.
    fn confirm(&mut self, dcid: &[u8]) -> Option<ConnectionId> {
        if self.confirmed || dcid != self.scid.as_bytes() {
            return None;
        }
        self.confirmed = true;
        Some(self.original_dcid)
    }

    /// Feed one datagram to the connection
    pub fn recv(&mut self, peer: SocketAddr, pkt: &[u8]) {
        self.peer = peer;
        self.packets += 1;
        self.bytes += pkt.len() as u64;
    }

    /// Connection id chosen by this server
    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    /// Destination id of the client's first Initial
    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    /// Last address the peer sent from
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the peer has addressed the server id
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Negotiated version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Datagrams received
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Bytes received
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// What happened to a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demux {
    /// Fed to an existing connection
    Existing,
    /// Opened a new connection
    Accepted,
    /// Answered with Version Negotiation
    Negotiated,
    /// Dropped
    Rejected,
}

/// Demultiplexing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuicStats {
    /// Datagrams fed to existing connections
    pub existing: u64,
    /// Connections opened
    pub accepted: u64,
    /// Version Negotiation packets sent
    pub negotiated: u64,
    /// Datagrams dropped
    pub rejected: u64,
}

/// QUIC backend: single-datagram I/O plus a connection table
pub struct QuicBackend {
    udp: Recvfrom,
    table: ConnTable<QuicConn>,
    credentials: Option<Credentials>,
    stats: QuicStats,
}

impl QuicBackend {
    /// Create the table and check credentials
    pub fn new(config: &QuicConfig) -> Result<Self, TransportError> {
        let table = ConnTable::new(config.table)
            .map_err(|e| TransportError::BackendInit(format!("QUIC table: {e}")))?;
        Ok(Self {
            udp: Recvfrom::new(),
            table,
            credentials: Credentials::load(config)?,
            stats: QuicStats::default(),
        })
    }

    /// Connection table
    pub fn table(&self) -> &ConnTable<QuicConn> {
        &self.table
    }

    /// Demultiplexing counters
    pub fn stats(&self) -> QuicStats {
        self.stats
    }

    /// Credentials in use, if any
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Receive one datagram and route it
    pub fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = self.udp.recv(fd)?;
        let Some((remote, pkt)) = self.udp.received() else {
            return Ok(n);
        };

        let mut vn = [0u8; MAX_VN_LEN];
        let outcome = demux(
            &mut self.table,
            self.credentials.is_some(),
            remote,
            pkt,
            &mut vn,
            Instant::now(),
        );
        match outcome {
            (Demux::Existing, _) => self.stats.existing += 1,
            (Demux::Accepted, _) => self.stats.accepted += 1,
            (Demux::Negotiated, len) => {
                self.stats.negotiated += 1;
                self.udp.stage_reply(|out| {
                    let len = len.min(out.len());
                    out[..len].copy_from_slice(&vn[..len]);
                    len
                });
            }
            (Demux::Rejected, _) => self.stats.rejected += 1,
        }
        Ok(n)
    }

    /// Stream data is processed by the per-connection engine behind
    /// [`QuicConn::recv`], so nothing reaches the query layer here. Only a
    /// staged Version Negotiation reply is pending after `recv`.
    pub fn handle(&mut self, _ctx: &mut UdpContext) {
        trace!(
            connections = self.table.len(),
            "QUIC datagram routed to connection engine"
        );
    }

    /// Send the staged datagram, if any
    pub fn send(&mut self) -> io::Result<usize> {
        self.udp.send()
    }

    /// Expire idle connections
    pub fn sweep(&mut self) {
        let swept = self.table.sweep(Instant::now());
        if swept > 0 {
            debug!(swept, remaining = self.table.len(), "QUIC table sweep");
        }
    }
}

impl Drop for QuicBackend {
    fn drop(&mut self) {
        debug!(
            connections = self.table.len(),
            accepted = self.stats.accepted,
            negotiated = self.stats.negotiated,
            rejected = self.stats.rejected,
            "QUIC backend closed"
        );
    }
}

/// Route one datagram. For [`Demux::Negotiated`] the reply is written to
/// `vn` and its length returned alongside.
pub fn demux(
    table: &mut ConnTable<QuicConn>,
    accept_new: bool,
    remote: SocketAddr,
    pkt: &[u8],
    vn: &mut [u8],
    now: Instant,
) -> (Demux, usize) {
    let hdr = match decode_version_cid(pkt, SERVER_CID_LEN) {
        Ok(hdr) => hdr,
        Err(e) => {
            trace!(%remote, "QUIC header rejected: {}", e);
            return (Demux::Rejected, 0);
        }
    };

    if hdr.needs_version_negotiation() {
        return match write_version_negotiation(vn, &hdr) {
            Ok(len) => (Demux::Negotiated, len),
            Err(_) => (Demux::Rejected, 0),
        };
    }

    if let Some(conn) = table.find_mut(hdr.dcid, now) {
        conn.recv(remote, pkt);
        if let Some(original) = conn.confirm(hdr.dcid) {
            table.retire(original.as_bytes());
            trace!(%remote, cid = %original, "QUIC original destination id retired");
        }
        return (Demux::Existing, 0);
    }

    if let Err(e) = accept_initial(pkt, &hdr) {
        trace!(%remote, "QUIC datagram for unknown connection dropped: {}", e);
        return (Demux::Rejected, 0);
    }
    if !accept_new {
        trace!(%remote, "QUIC Initial dropped, no credentials");
        return (Demux::Rejected, 0);
    }

    let (Ok(dcid), Some(version)) = (ConnectionId::new(hdr.dcid), hdr.version) else {
        return (Demux::Rejected, 0);
    };
    let conn = QuicConn::new(dcid, remote, version);
    let scid = *conn.scid();
    if let Err(e) = table.add(scid, conn, now).map(|conn| conn.recv(remote, pkt)) {
        debug!(%remote, "QUIC connection refused: {}", e);
        return (Demux::Rejected, 0);
    }
    if let Err(e) = table.add_alias(scid.as_bytes(), dcid) {
        table.remove(scid.as_bytes());
        debug!(%remote, original = %dcid, "QUIC connection refused: {}", e);
        return (Demux::Rejected, 0);
    }
    debug!(%remote, cid = %scid, original = %dcid, "QUIC connection accepted");
    (Demux::Accepted, 0)
}
