//! Packet backends.
//!
//! Every worker drives one backend through the same four steps: receive from
//! a ready descriptor, answer what was received, send the answers, and sweep
//! between waits. The variants differ only in how datagrams reach memory.

mod addr;
pub(crate) mod pktinfo;
mod recvfrom;
#[cfg(target_os = "linux")]
mod recvmmsg;

pub use pktinfo::Pktinfo;
pub use recvfrom::Recvfrom;
#[cfg(target_os = "linux")]
pub use recvmmsg::{RECVMMSG_BATCHLEN, Recvmmsg};

use crate::error::TransportError;
use crate::handler::UdpContext;
use crate::quic::{QuicBackend, QuicConfig};
use crate::xdp::{XdpHandle, XdpRing};
use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// The receive/handle/send cycle of a packet backend
pub trait PacketApi {
    /// Receive from `fd` without blocking; returns the number of datagrams
    fn recv(&mut self, fd: RawFd) -> io::Result<usize>;

    /// Answer everything received by the last [`recv`](Self::recv)
    fn handle(&mut self, ctx: &mut UdpContext);

    /// Send the answers; returns the number of datagrams sent
    fn send(&mut self) -> io::Result<usize>;

    /// Between-wait maintenance
    fn sweep(&mut self) {}
}

/// Backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One datagram per system call
    Recvfrom,
    /// Batched datagrams (Linux)
    Recvmmsg,
    /// XDP ring
    Xdp,
    /// QUIC demultiplexing
    Quic,
}

impl BackendKind {
    /// Backend for plain UDP workers on this platform
    pub fn default_udp() -> Self {
        if cfg!(target_os = "linux") {
            Self::Recvmmsg
        } else {
            Self::Recvfrom
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recvfrom => write!(f, "recvfrom"),
            Self::Recvmmsg => write!(f, "recvmmsg"),
            Self::Xdp => write!(f, "xdp"),
            Self::Quic => write!(f, "quic"),
        }
    }
}

/// An initialized backend
pub enum Backend {
    /// See [`Recvfrom`]
    Recvfrom(Box<Recvfrom>),
    /// See [`Recvmmsg`]
    #[cfg(target_os = "linux")]
    Recvmmsg(Box<Recvmmsg>),
    /// See [`XdpHandle`]
    Xdp(XdpHandle),
    /// See [`QuicBackend`]
    Quic(Box<QuicBackend>),
}

impl Backend {
    /// Allocate the state for `kind`.
    ///
    /// XDP needs the worker's ring; QUIC reads its table and credential
    /// settings from `quic`.
    pub fn init(
        kind: BackendKind,
        xdp_ring: Option<Box<dyn XdpRing>>,
        quic: &QuicConfig,
    ) -> Result<Self, TransportError> {
        match kind {
            BackendKind::Recvfrom => Ok(Self::Recvfrom(Box::default())),
            #[cfg(target_os = "linux")]
            BackendKind::Recvmmsg => Ok(Self::Recvmmsg(Box::default())),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Recvmmsg => {
                tracing::debug!("recvmmsg unavailable, using recvfrom");
                Ok(Self::Recvfrom(Box::default()))
            }
            BackendKind::Xdp => xdp_ring
                .map(|ring| Self::Xdp(XdpHandle::new(ring)))
                .ok_or_else(|| TransportError::BackendInit("XDP worker without a ring".into())),
            BackendKind::Quic => Ok(Self::Quic(Box::new(QuicBackend::new(quic)?))),
        }
    }

    /// Variant in use
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Recvfrom(_) => BackendKind::Recvfrom,
            #[cfg(target_os = "linux")]
            Self::Recvmmsg(_) => BackendKind::Recvmmsg,
            Self::Xdp(_) => BackendKind::Xdp,
            Self::Quic(_) => BackendKind::Quic,
        }
    }
}

impl PacketApi for Backend {
    fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        match self {
            Self::Recvfrom(b) => b.recv(fd),
            #[cfg(target_os = "linux")]
            Self::Recvmmsg(b) => b.recv(fd),
            Self::Xdp(b) => b.recv(),
            Self::Quic(b) => b.recv(fd),
        }
    }

    fn handle(&mut self, ctx: &mut UdpContext) {
        match self {
            Self::Recvfrom(b) => b.handle(ctx),
            #[cfg(target_os = "linux")]
            Self::Recvmmsg(b) => b.handle(ctx),
            Self::Xdp(b) => b.handle(ctx),
            Self::Quic(b) => b.handle(ctx),
        }
    }

    fn send(&mut self) -> io::Result<usize> {
        match self {
            Self::Recvfrom(b) => b.send(),
            #[cfg(target_os = "linux")]
            Self::Recvmmsg(b) => b.send(),
            Self::Xdp(b) => b.send(),
            Self::Quic(b) => b.send(),
        }
    }

    fn sweep(&mut self) {
        match self {
            Self::Xdp(b) => b.sweep(),
            Self::Quic(b) => b.sweep(),
            _ => {}
        }
    }
}
