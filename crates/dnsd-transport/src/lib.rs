//! # dnsd Transport
//!
//! Packet I/O for the dnsd authoritative server.
//!
//! This crate provides:
//! - Single-datagram (`recvmsg`/`sendmsg`) and batched (`recvmmsg`/`sendmmsg`)
//!   UDP backends with packet-info handling
//! - An XDP backend over a pluggable frame ring, with an in-process UMEM
//! - QUIC datagram demultiplexing over a per-worker connection table
//! - Worker threads with CPU pinning and a static descriptor partition
//!
//! ## Worker layout
//!
//! ```text
//!   thread ids:   0 .. udp        udp .. udp+xdp      udp+xdp .. total
//!                 ┌──────────┐    ┌──────────────┐    ┌──────────────┐
//!   role:         │   UDP    │    │     XDP      │    │     QUIC     │
//!   backend:      │ recvmmsg │    │  XdpHandle   │    │ QuicBackend  │
//!                 └────┬─────┘    └──────┬───────┘    └──────┬───────┘
//!                      └─────── UdpContext (query layer) ────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod error;
pub mod fdset;
pub mod handler;
pub mod iface;
pub mod numa;
pub mod quic;
pub mod server;
pub mod worker;
pub mod xdp;

pub use backend::{Backend, BackendKind, PacketApi};
pub use error::{QuicError, TableError, TransportError};
pub use handler::UdpContext;
pub use iface::{IfaceDescriptor, ThreadPartition};
pub use quic::{ConnTable, ConnectionId, QuicBackend, QuicConfig, TableConfig};
pub use server::{Server, ServerConfig, ServerHandle, XdpInterface};
pub use worker::{Role, ServerStats, WorkerSpec, WorkerStats, udp_master};
#[cfg(target_os = "linux")]
pub use xdp::AfXdpRing;
pub use xdp::{FrameDesc, UmemConfig, UmemPort, UmemRing, XdpError, XdpHandle, XdpRing};
