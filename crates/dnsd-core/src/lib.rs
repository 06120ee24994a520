//! # dnsd Core
//!
//! Message-processing core of the dnsd authoritative DNS server.
//!
//! This crate provides:
//! - A transport-independent layer state machine shared by inbound query
//!   serving and outbound single-shot exchanges
//! - Server-side query processing over a pluggable zone database
//! - A synchronous requestor (TCP/UDP, connection reuse) and outgoing NOTIFY
//! - Per-exchange bump arenas and the minimal wire helpers the core needs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  QueryHandler (server role)  │   │  NotifyHandler (client role) │
//! │  consume query -> produce    │   │  produce NOTIFY -> consume   │
//! └──────────────┬───────────────┘   └──────────────┬───────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Layer state machine                          │
//! │     Begin -> Produce <-> Consume -> Done | Fail | Noop           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Arena (reset once per exchange)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod error;
pub mod layer;
pub mod notify;
pub mod query;
pub mod requestor;
pub mod wire;
pub mod zone;

pub use arena::{Arena, DEFAULT_BLOCK_SIZE, Span};
pub use error::{ArenaError, NotifyError, Reply, RequestError, WireError, ZoneError};
pub use layer::{Layer, LayerEnv, LayerFlags, LayerHandler, LayerState};
pub use notify::{
    NotifyConfig, NotifyHandler, NotifyOutcome, NotifyParams, NotifyReport, Remote, RemoteAddr,
    event_notify, send_notify,
};
pub use query::{
    QueryHandler, QueryKind, QueryParams, QuestionRef, Responder, Transport, handle_query,
};
pub use requestor::{ConnectionPool, Request, RequestFlags, Requestor};
pub use wire::{MAX_PKTSIZE, MAX_UDP_PAYLOAD, Name, Opcode, Packet, PacketWriter, Rcode};
pub use zone::{Zone, ZoneSet};
