//! Outgoing NOTIFY.
//!
//! [`NotifyHandler`] is the client-role [`LayerHandler`] that builds a NOTIFY
//! for a zone and accepts whatever reply comes back. [`event_notify`] walks the
//! remotes configured for a zone, trying each remote's addresses in order until
//! one of them is reached.

use crate::arena::{Arena, DEFAULT_BLOCK_SIZE};
use crate::error::{NotifyError, RequestError, WireError};
use crate::layer::{LayerEnv, LayerHandler, LayerState};
use crate::requestor::{ConnectionPool, Request, RequestFlags, Requestor};
use crate::wire::{
    CLASS_IN, Edns, MAX_UDP_PAYLOAD, Name, Opcode, Packet, PacketWriter, Rcode, Record, Section,
    rtype, soa_serial,
};
use crate::zone::Zone;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What a NOTIFY exchange is about
#[derive(Debug, Clone)]
pub struct NotifyParams {
    /// Zone apex
    pub zone: Name,
    /// Current SOA, sent as an unsigned hint in the answer section
    pub soa: Option<Record>,
    /// EDNS parameters for the request
    pub edns: Edns,
}

/// Client-role handler producing one NOTIFY
#[derive(Debug, Default)]
pub struct NotifyHandler {
    params: Option<NotifyParams>,
}

impl NotifyHandler {
    /// Create an idle handler
    pub fn new() -> Self {
        Self::default()
    }

    fn write(params: &NotifyParams, out: &mut PacketWriter<'_>) -> Result<(), WireError> {
        out.clear();
        out.set_id(rand::random());
        out.set_opcode(Opcode::Notify);
        out.set_aa(true);
        out.put_question(params.zone.as_wire(), CLASS_IN, rtype::SOA)?;

        if let Some(soa) = &params.soa {
            out.begin(Section::Answer)?;
            out.put_record(soa)?;
        }

        out.put_opt(&params.edns)
    }
}

impl LayerHandler for NotifyHandler {
    type Params = NotifyParams;

    fn begin(&mut self, _env: &mut LayerEnv<'_>, params: NotifyParams) -> LayerState {
        self.params = Some(params);
        LayerState::Produce
    }

    fn produce(&mut self, _env: &mut LayerEnv<'_>, out: &mut PacketWriter<'_>) -> LayerState {
        let Some(params) = &self.params else {
            return LayerState::Fail;
        };
        match Self::write(params, out) {
            Ok(()) => LayerState::Consume,
            Err(_) => LayerState::Fail,
        }
    }

    fn consume(&mut self, _env: &mut LayerEnv<'_>, _pkt: &Packet<'_>) -> LayerState {
        LayerState::Done
    }

    fn finish(&mut self, _env: &mut LayerEnv<'_>) -> LayerState {
        self.params = None;
        LayerState::Noop
    }
}

/// Settings shared by all NOTIFY exchanges
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Deadline for one exchange
    pub timeout: Duration,
    /// Use TCP Fast Open for new connections
    pub tcp_fastopen: bool,
    /// EDNS payload advertised in requests
    pub edns_payload: u16,
    /// Idle connection pool for reuse across exchanges
    pub pool: Option<Arc<ConnectionPool>>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            tcp_fastopen: false,
            edns_payload: MAX_UDP_PAYLOAD,
            pool: None,
        }
    }
}

/// One address of a remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    /// Destination
    pub addr: SocketAddr,
    /// Source address to send from
    pub via: Option<SocketAddr>,
}

impl RemoteAddr {
    /// Address without a fixed source
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, via: None }
    }
}

/// A configured NOTIFY target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    /// Configuration identifier
    pub id: String,
    /// Addresses tried in order
    pub addresses: Vec<RemoteAddr>,
    /// Signing key reference
    pub key: Option<String>,
}

/// Result of one NOTIFY exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The remote accepted the serial
    Delivered {
        /// Serial sent
        serial: u32,
    },
    /// The remote answered with an error code
    Rejected {
        /// Response code from the remote
        rcode: Rcode,
    },
    /// The remote could not be reached
    Failed {
        /// Local failure description
        reason: String,
    },
}

impl NotifyOutcome {
    /// Whether the remote answered at all
    #[must_use]
    pub fn is_reached(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for NotifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered { serial } => write!(f, "serial {serial}"),
            Self::Rejected { rcode } => write!(f, "server responded with error '{rcode}'"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// Outcome for one remote
#[derive(Debug, Clone)]
pub struct RemoteReport {
    /// Remote identifier
    pub id: String,
    /// Last address tried
    pub address: Option<SocketAddr>,
    /// Outcome on that address
    pub outcome: NotifyOutcome,
}

/// Per-remote outcomes of one zone NOTIFY run
#[derive(Debug, Clone, Default)]
pub struct NotifyReport {
    /// One entry per configured remote, in configuration order
    pub remotes: Vec<RemoteReport>,
}

impl NotifyReport {
    /// Remotes that could not be reached
    pub fn failed(&self) -> usize {
        self.remotes
            .iter()
            .filter(|r| !r.outcome.is_reached())
            .count()
    }

    /// Remotes that accepted the serial
    pub fn delivered(&self) -> usize {
        self.remotes
            .iter()
            .filter(|r| matches!(r.outcome, NotifyOutcome::Delivered { .. }))
            .count()
    }
}

/// Send one NOTIFY for `zone` to a single address and log the outcome
pub fn send_notify(
    config: &NotifyConfig,
    zone: &Zone,
    soa: &Record,
    target: &RemoteAddr,
    key: Option<&str>,
) -> NotifyOutcome {
    let mut flags = RequestFlags::new();
    if config.tcp_fastopen {
        flags = flags.with_tfo();
    }
    let request = Request {
        remote: target.addr,
        source: target.via,
        flags,
        key: key.map(str::to_owned),
        timeout: config.timeout,
    };
    let params = NotifyParams {
        zone: zone.name().clone(),
        soa: Some(soa.clone()),
        edns: Edns::new(config.edns_payload),
    };

    let mut requestor = Requestor::new(NotifyHandler::new(), Arena::with_capacity(DEFAULT_BLOCK_SIZE));
    if let Some(pool) = &config.pool {
        requestor = requestor.with_pool(pool.clone());
    }

    let serial = soa_serial(&soa.rdata).unwrap_or(0);
    let zone_name = zone.name();
    match requestor.exec(&request, params) {
        Ok(reply) if reply.rcode == Rcode::NOERROR => {
            info!(zone = %zone_name, remote = %target.addr, reused = reply.reused, "NOTIFY, outgoing, serial {}", serial);
            zone.set_last_notified(serial);
            NotifyOutcome::Delivered { serial }
        }
        Ok(reply) => {
            warn!(
                zone = %zone_name,
                remote = %target.addr,
                reused = reply.reused,
                "NOTIFY, outgoing, server responded with error '{}'",
                reply.rcode
            );
            NotifyOutcome::Rejected { rcode: reply.rcode }
        }
        Err(err) => {
            let reason = describe(&err);
            warn!(zone = %zone_name, remote = %target.addr, reused = false, "NOTIFY, outgoing, failed ({})", reason);
            NotifyOutcome::Failed { reason }
        }
    }
}

fn describe(err: &RequestError) -> String {
    match err {
        RequestError::Timeout => "connection timeout".to_string(),
        other => other.to_string(),
    }
}

/// Notify every remote of a zone change.
///
/// Each remote's addresses are tried in order until one is reached; a reply
/// with an error code counts as reached. The run fails only when no remote
/// was reached at all. A zone without contents has nothing to announce.
pub fn event_notify(
    config: &NotifyConfig,
    zone: &Zone,
    remotes: &[Remote],
) -> Result<NotifyReport, NotifyError> {
    let mut report = NotifyReport::default();
    let Some(soa) = zone.soa_record() else {
        return Ok(report);
    };

    for remote in remotes {
        let mut entry = RemoteReport {
            id: remote.id.clone(),
            address: None,
            outcome: NotifyOutcome::Failed {
                reason: "no address".to_string(),
            },
        };
        for target in &remote.addresses {
            entry.address = Some(target.addr);
            entry.outcome = send_notify(config, zone, &soa, target, remote.key.as_deref());
            if entry.outcome.is_reached() {
                break;
            }
        }
        report.remotes.push(entry);
    }

    let failed = report.failed();
    let total = report.remotes.len();
    if total > 0 && failed == total {
        return Err(NotifyError::AllRemotesFailed { failed, total });
    }
    Ok(report)
}
