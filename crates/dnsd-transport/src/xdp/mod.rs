//! XDP packet path.
//!
//! An XDP worker owns exactly one ring. Received descriptors point at whole
//! Ethernet frames in the ring's memory; each is parsed, answered through the
//! query layer straight into a transmit frame, and the transmit frames leave
//! in one batch. Receive frames go back to the ring as soon as they have been
//! answered.
//!
//! [`AfXdpRing`] is the ring bound to a NIC queue. [`UmemRing`] keeps the
//! same frame discipline in process memory and is fed through a [`UmemPort`];
//! tests and benchmarks attach it to a server in place of a NIC queue.

pub mod frame;
#[cfg(target_os = "linux")]
pub mod socket;
pub mod umem;

pub use frame::{FrameError, FrameMeta, parse_frame, write_headers, write_reply};
#[cfg(target_os = "linux")]
pub use socket::AfXdpRing;
pub use umem::{RingBuffer, UmemConfig, UmemPort, UmemRing};

use crate::handler::UdpContext;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Frames processed per receive call
pub const XDP_BATCHLEN: usize = 32;

/// XDP ring errors
#[derive(Debug, Error)]
pub enum XdpError {
    /// Invalid UMEM or ring configuration
    #[error("Invalid XDP configuration: {0}")]
    InvalidConfig(String),

    /// Descriptor ring has no room
    #[error("Ring full")]
    RingFull,

    /// Frame larger than a UMEM frame
    #[error("Frame of {len} bytes exceeds frame capacity {max}")]
    FrameTooLarge {
        /// Frame length
        len: usize,
        /// Frame capacity
        max: usize,
    },

    /// Wake descriptor could not be created
    #[error("Wake descriptor: {0}")]
    Wake(#[source] io::Error),

    /// Interface name does not resolve to an index
    #[error("No such interface: {0}")]
    NoSuchInterface(String),

    /// XDP sockets are not available on this platform
    #[error("AF_XDP is not supported on this platform")]
    Unsupported,

    /// Socket, mapping or BPF map call failed
    #[error("XDP {op} failed: {source}")]
    Sys {
        /// Failed step
        op: &'static str,
        /// OS error
        #[source]
        source: io::Error,
    },
}

/// Descriptor of one frame in ring memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDesc {
    /// Offset of the packet in the frame area
    pub addr: u64,

    /// Packet length
    pub len: u32,
}

/// A receive/transmit ring pair over shared frame memory
pub trait XdpRing: Send {
    /// Descriptor that becomes readable when frames arrive
    fn fd(&self) -> RawFd;

    /// Take up to `out.len()` received frames
    fn recv(&mut self, out: &mut [FrameDesc]) -> io::Result<usize>;

    /// Claim a free frame for transmission; `len` is its full capacity
    fn alloc_tx(&mut self) -> Option<FrameDesc>;

    /// Borrow a received frame and a transmit frame at the same time
    fn frame_pair(&mut self, rx: FrameDesc, tx: FrameDesc) -> Option<(&[u8], &mut [u8])>;

    /// Transmit frames previously claimed with [`alloc_tx`](Self::alloc_tx).
    ///
    /// The ring owns every passed frame afterwards, sent or not.
    fn send(&mut self, frames: &[FrameDesc]) -> io::Result<usize>;

    /// Return a frame to the ring without transmitting it
    fn release(&mut self, desc: FrameDesc);

    /// Pick up interface changes between batches
    fn reconfigure(&mut self) {}

    /// Periodic housekeeping
    fn sweep(&mut self) {}
}

/// Per-worker XDP state: the ring and the frames of the current batch
pub struct XdpHandle {
    ring: Box<dyn XdpRing>,
    rx: [FrameDesc; XDP_BATCHLEN],
    rcvd: usize,
    tx: Vec<FrameDesc>,
}

impl XdpHandle {
    /// Wrap a ring
    pub fn new(ring: Box<dyn XdpRing>) -> Self {
        Self {
            ring,
            rx: [FrameDesc::default(); XDP_BATCHLEN],
            rcvd: 0,
            tx: Vec::with_capacity(XDP_BATCHLEN),
        }
    }

    /// Descriptor to poll
    pub fn fd(&self) -> RawFd {
        self.ring.fd()
    }

    /// Receive a batch of frames
    pub fn recv(&mut self) -> io::Result<usize> {
        self.rcvd = self.ring.recv(&mut self.rx)?;
        Ok(self.rcvd)
    }

    /// Replies waiting to be sent
    pub fn pending_replies(&self) -> usize {
        self.tx.len()
    }

    /// Answer every received frame and give the receive frames back
    pub fn handle(&mut self, ctx: &mut UdpContext) {
        let fd = self.ring.fd();
        for i in 0..std::mem::take(&mut self.rcvd) {
            let rx = self.rx[i];
            let Some(tx) = self.ring.alloc_tx() else {
                tracing::trace!("No free transmit frame, dropping query");
                self.ring.release(rx);
                continue;
            };

            let len = match self.ring.frame_pair(rx, tx) {
                Some((req, out)) => answer(ctx, fd, req, out),
                None => 0,
            };
            self.ring.release(rx);

            if len > 0 {
                self.tx.push(FrameDesc {
                    addr: tx.addr,
                    len: len as u32,
                });
            } else {
                self.ring.release(tx);
            }
        }
    }

    /// Transmit the batch
    pub fn send(&mut self) -> io::Result<usize> {
        if self.tx.is_empty() {
            return Ok(0);
        }
        let result = self.ring.send(&self.tx);
        self.tx.clear();
        result
    }

    /// Between-batch maintenance
    pub fn sweep(&mut self) {
        self.ring.reconfigure();
        self.ring.sweep();
    }
}

fn answer(ctx: &mut UdpContext, fd: RawFd, req: &[u8], out: &mut [u8]) -> usize {
    let meta = match parse_frame(req) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::trace!("Ignoring frame: {}", e);
            return 0;
        }
    };
    let hdr_len = meta.reply_header_len();
    if out.len() <= hdr_len {
        return 0;
    }

    let payload = ctx.handle(
        Some(fd),
        meta.src,
        Some(meta.dst),
        &req[meta.payload.clone()],
        &mut out[hdr_len..],
    );
    if payload == 0 {
        return 0;
    }
    write_reply(&meta, out, payload).unwrap_or(0)
}
