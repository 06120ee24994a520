//! In-process UMEM and descriptor rings.
//!
//! [`UmemRing`] keeps the AF_XDP memory model: one contiguous frame area
//! carved into fixed-size frames, descriptors naming frames by offset, and
//! producer/consumer rings moving descriptors between the two sides. The
//! "device" side is a [`UmemPort`] that injects Ethernet frames and collects
//! transmitted ones, which lets the XDP worker path run without a NIC.

use super::{FrameDesc, XdpError, XdpRing};
use crossbeam_queue::ArrayQueue;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const XDP_PACKET_HEADROOM: usize = 256;
const XDP_UMEM_MIN_CHUNK_SIZE: usize = 2048;

/// UMEM configuration
#[derive(Debug, Clone)]
pub struct UmemConfig {
    /// Number of frames in the area
    pub frame_count: u32,

    /// Frame size (power of two, at least 2048)
    pub frame_size: usize,

    /// Headroom in front of each packet
    pub headroom: usize,

    /// Descriptor ring size (power of two)
    pub ring_size: u32,
}

impl Default for UmemConfig {
    fn default() -> Self {
        Self {
            frame_count: 2048,
            frame_size: XDP_UMEM_MIN_CHUNK_SIZE,
            headroom: XDP_PACKET_HEADROOM,
            ring_size: 1024,
        }
    }
}

impl UmemConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), XdpError> {
        if !self.frame_size.is_power_of_two() {
            return Err(XdpError::InvalidConfig(
                "frame_size must be power of 2".into(),
            ));
        }
        if self.frame_size < XDP_UMEM_MIN_CHUNK_SIZE {
            return Err(XdpError::InvalidConfig(format!(
                "frame_size must be at least {XDP_UMEM_MIN_CHUNK_SIZE}"
            )));
        }
        if self.headroom >= self.frame_size {
            return Err(XdpError::InvalidConfig(
                "headroom must be smaller than frame_size".into(),
            ));
        }
        if self.frame_count == 0 {
            return Err(XdpError::InvalidConfig("frame_count must be > 0".into()));
        }
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(XdpError::InvalidConfig(
                "ring_size must be power of 2".into(),
            ));
        }
        Ok(())
    }

    /// Usable packet bytes per frame
    pub fn frame_capacity(&self) -> usize {
        self.frame_size - self.headroom
    }

    fn area_len(&self) -> usize {
        self.frame_count as usize * self.frame_size
    }
}

/// Producer/consumer indices of a descriptor ring.
///
/// Indices run freely and wrap; the slot of an index is `index & (size - 1)`.
pub struct RingBuffer {
    size: u32,
    producer: AtomicU32,
    consumer: AtomicU32,
    cached_prod: u32,
    cached_cons: u32,
}

impl RingBuffer {
    /// Create a ring of `size` entries; `size` must be a power of two
    pub fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            size,
            producer: AtomicU32::new(0),
            consumer: AtomicU32::new(0),
            cached_prod: 0,
            cached_cons: 0,
        }
    }

    /// Entries free for production, counting unsubmitted reservations
    pub fn available(&self) -> u32 {
        let cons = self.consumer.load(Ordering::Acquire);
        self.size - self.cached_prod.wrapping_sub(cons)
    }

    /// Entries ready for consumption, net of unreleased peeks
    pub fn ready(&self) -> u32 {
        let prod = self.producer.load(Ordering::Acquire);
        prod.wrapping_sub(self.cached_cons)
    }

    /// Reserve `count` entries; returns the first index
    pub fn reserve(&mut self, count: u32) -> Option<u32> {
        if self.available() < count {
            return None;
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(count);
        Some(idx)
    }

    /// Publish reserved entries
    pub fn submit(&mut self, count: u32) {
        self.producer.fetch_add(count, Ordering::Release);
    }

    /// Take `count` ready entries; returns the first index
    pub fn peek(&mut self, count: u32) -> Option<u32> {
        if self.ready() < count {
            return None;
        }
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        Some(idx)
    }

    /// Hand consumed entries back to the producer
    pub fn release(&mut self, count: u32) {
        self.consumer.fetch_add(count, Ordering::Release);
    }

    fn slot(&self, idx: u32) -> usize {
        (idx & (self.size - 1)) as usize
    }
}

struct DescRing {
    ring: RingBuffer,
    slots: Box<[FrameDesc]>,
}

impl DescRing {
    fn new(size: u32) -> Self {
        Self {
            ring: RingBuffer::new(size),
            slots: vec![FrameDesc::default(); size as usize].into_boxed_slice(),
        }
    }

    fn push(&mut self, desc: FrameDesc) -> bool {
        let Some(idx) = self.ring.reserve(1) else {
            return false;
        };
        let slot = self.ring.slot(idx);
        self.slots[slot] = desc;
        self.ring.submit(1);
        true
    }

    fn pop(&mut self) -> Option<FrameDesc> {
        let idx = self.ring.peek(1)?;
        let desc = self.slots[self.ring.slot(idx)];
        self.ring.release(1);
        Some(desc)
    }
}

/// Device side of a [`UmemRing`]
pub struct UmemPort {
    inbound: ArrayQueue<Vec<u8>>,
    outbound: ArrayQueue<Vec<u8>>,
    wake: Wake,
    max_frame: usize,
    rx_dropped: AtomicU64,
}

impl UmemPort {
    /// Queue an Ethernet frame for reception
    pub fn inject(&self, frame: &[u8]) -> Result<(), XdpError> {
        if frame.len() > self.max_frame {
            return Err(XdpError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        if self.inbound.push(frame.to_vec()).is_err() {
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(XdpError::RingFull);
        }
        self.wake.signal();
        Ok(())
    }

    /// Collect every frame transmitted so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.outbound.pop()).collect()
    }

    /// Frames refused because the inbound queue was full
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }
}

/// Worker side of an in-process UMEM
pub struct UmemRing {
    config: UmemConfig,
    area: Box<[u8]>,
    free: Vec<u64>,
    rx: DescRing,
    tx: DescRing,
    port: Arc<UmemPort>,
}

impl UmemRing {
    /// Allocate the frame area and rings
    pub fn new(config: UmemConfig) -> Result<Self, XdpError> {
        config.validate()?;
        let frame_size = config.frame_size as u64;
        let free = (0..u64::from(config.frame_count))
            .rev()
            .map(|i| i * frame_size)
            .collect();
        let port = Arc::new(UmemPort {
            inbound: ArrayQueue::new(config.ring_size as usize),
            outbound: ArrayQueue::new(config.ring_size as usize),
            wake: Wake::new().map_err(XdpError::Wake)?,
            max_frame: config.frame_capacity(),
            rx_dropped: AtomicU64::new(0),
        });
        Ok(Self {
            area: vec![0u8; config.area_len()].into_boxed_slice(),
            rx: DescRing::new(config.ring_size),
            tx: DescRing::new(config.ring_size),
            free,
            port,
            config,
        })
    }

    /// Device handle for injecting and collecting frames
    pub fn port(&self) -> Arc<UmemPort> {
        Arc::clone(&self.port)
    }

    /// Configuration in use
    pub fn config(&self) -> &UmemConfig {
        &self.config
    }

    /// Frames not owned by any ring
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    fn base(&self, addr: u64) -> u64 {
        addr - addr % self.config.frame_size as u64
    }

    fn range(&self, desc: FrameDesc) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(desc.addr).ok()?;
        let end = start.checked_add(desc.len as usize)?;
        let frame_end = self.base(desc.addr) as usize + self.config.frame_size;
        (end <= frame_end && end <= self.area.len()).then_some(start..end)
    }

    fn alloc(&mut self) -> Option<FrameDesc> {
        let base = self.free.pop()?;
        Some(FrameDesc {
            addr: base + self.config.headroom as u64,
            len: self.config.frame_capacity() as u32,
        })
    }

    /// Move injected frames into UMEM and onto the rx ring
    fn fill(&mut self) {
        while self.rx.ring.available() > 0 {
            let Some(mut desc) = self.alloc() else {
                break;
            };
            let Some(frame) = self.port.inbound.pop() else {
                self.release(desc);
                break;
            };
            let start = desc.addr as usize;
            self.area[start..start + frame.len()].copy_from_slice(&frame);
            desc.len = frame.len() as u32;
            self.rx.push(desc);
        }
    }
}

impl XdpRing for UmemRing {
    fn fd(&self) -> RawFd {
        self.port.wake.fd()
    }

    fn recv(&mut self, out: &mut [FrameDesc]) -> io::Result<usize> {
        self.port.wake.drain();
        self.fill();
        let mut n = 0;
        while n < out.len() {
            let Some(desc) = self.rx.pop() else {
                break;
            };
            out[n] = desc;
            n += 1;
        }
        if self.rx.ring.ready() > 0 || !self.port.inbound.is_empty() {
            self.port.wake.signal();
        }
        Ok(n)
    }

    fn alloc_tx(&mut self) -> Option<FrameDesc> {
        self.alloc()
    }

    fn frame_pair(&mut self, rx: FrameDesc, tx: FrameDesc) -> Option<(&[u8], &mut [u8])> {
        let rx_range = self.range(rx)?;
        let tx_range = self.range(tx)?;
        if self.base(rx.addr) == self.base(tx.addr) {
            return None;
        }
        if rx_range.start < tx_range.start {
            let (lo, hi) = self.area.split_at_mut(tx_range.start);
            Some((&lo[rx_range], &mut hi[..tx_range.len()]))
        } else {
            let (lo, hi) = self.area.split_at_mut(rx_range.start);
            Some((&hi[..rx_range.len()], &mut lo[tx_range]))
        }
    }

    fn send(&mut self, frames: &[FrameDesc]) -> io::Result<usize> {
        for &desc in frames {
            if !self.tx.push(desc) {
                self.release(desc);
            }
        }

        // Transmit and complete: copy out, return the frame to the free list.
        let mut sent = 0;
        while let Some(desc) = self.tx.pop() {
            if let Some(range) = self.range(desc) {
                if self.port.outbound.push(self.area[range].to_vec()).is_ok() {
                    sent += 1;
                }
            }
            self.release(desc);
        }
        Ok(sent)
    }

    fn release(&mut self, desc: FrameDesc) {
        let base = self.base(desc.addr);
        if base < self.area.len() as u64 && !self.free.contains(&base) {
            self.free.push(base);
        }
    }
}

/// Wake descriptor polled by the worker
struct Wake {
    #[cfg(target_os = "linux")]
    fd: std::os::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl Wake {
    fn new() -> io::Result<Self> {
        use std::os::fd::FromRawFd;
        // SAFETY: eventfd has no pointer arguments.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just created and is owned by nothing else.
        Ok(Self {
            fd: unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) },
        })
    }

    fn fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }

    fn signal(&self) {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64 to an eventfd.
        unsafe {
            libc::write(self.fd(), (&one as *const u64).cast(), 8);
        }
    }

    fn drain(&self) {
        let mut count: u64 = 0;
        // SAFETY: reads 8 bytes into a live u64; EAGAIN leaves it untouched.
        unsafe {
            libc::read(self.fd(), (&mut count as *mut u64).cast(), 8);
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Wake {
    fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn signal(&self) {}

    fn drain(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> UmemConfig {
        UmemConfig {
            frame_count: 8,
            ring_size: 4,
            ..UmemConfig::default()
        }
    }

    #[test]
    fn test_umem_config_default() {
        let config = UmemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_capacity(), 2048 - 256);
    }

    #[test]
    fn test_umem_config_validate() {
        let bad = UmemConfig {
            frame_size: 3000,
            ..UmemConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = UmemConfig {
            frame_size: 1024,
            ..UmemConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = UmemConfig {
            ring_size: 1000,
            ..UmemConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = UmemConfig {
            headroom: 2048,
            ..UmemConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ring_buffer_basic() {
        let mut ring = RingBuffer::new(16);
        assert_eq!(ring.available(), 16);
        assert_eq!(ring.ready(), 0);

        let idx = ring.reserve(4).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(ring.available(), 12);
        assert_eq!(ring.ready(), 0);
        ring.submit(4);
        assert_eq!(ring.ready(), 4);

        assert_eq!(ring.peek(2), Some(0));
        assert_eq!(ring.ready(), 2);
        ring.release(2);
        assert_eq!(ring.available(), 14);
    }

    #[test]
    fn test_ring_buffer_overflow() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.reserve(4).is_some());
        assert!(ring.reserve(1).is_none());
        ring.submit(4);
        assert!(ring.peek(5).is_none());
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut ring = RingBuffer::new(4);
        for _ in 0..10 {
            let idx = ring.reserve(3).unwrap();
            ring.submit(3);
            assert_eq!(ring.peek(3), Some(idx));
            ring.release(3);
            assert_eq!(ring.available(), 4);
        }
        assert_eq!(ring.slot(30), 2);
    }

    #[test]
    fn test_inject_and_receive() {
        let mut ring = UmemRing::new(small()).unwrap();
        let port = ring.port();
        port.inject(b"frame one").unwrap();
        port.inject(b"frame two").unwrap();

        let mut descs = [FrameDesc::default(); 4];
        assert_eq!(ring.recv(&mut descs).unwrap(), 2);
        assert_eq!(descs[0].len, 9);
        assert_eq!(ring.free_frames(), 6);

        let tx = ring.alloc_tx().unwrap();
        let (rx, out) = ring.frame_pair(descs[0], tx).unwrap();
        assert_eq!(rx, b"frame one");
        out[..5].copy_from_slice(b"reply");

        ring.release(descs[0]);
        ring.release(descs[1]);
        let sent = ring
            .send(&[FrameDesc {
                addr: tx.addr,
                len: 5,
            }])
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(port.take_sent(), vec![b"reply".to_vec()]);
        assert_eq!(ring.free_frames(), 8);
    }

    #[test]
    fn test_inject_limits() {
        let ring = UmemRing::new(small()).unwrap();
        let port = ring.port();
        let too_big = vec![0u8; 4096];
        assert!(matches!(
            port.inject(&too_big),
            Err(XdpError::FrameTooLarge { len: 4096, .. })
        ));
        for _ in 0..4 {
            port.inject(b"x").unwrap();
        }
        assert!(matches!(port.inject(b"x"), Err(XdpError::RingFull)));
        assert_eq!(port.rx_dropped(), 1);
    }

    #[test]
    fn test_frame_pair_rejects_same_frame() {
        let mut ring = UmemRing::new(small()).unwrap();
        let desc = ring.alloc_tx().unwrap();
        assert!(ring.frame_pair(desc, desc).is_none());
        let oversized = FrameDesc {
            addr: desc.addr,
            len: 4096,
        };
        let other = ring.alloc_tx().unwrap();
        assert!(ring.frame_pair(oversized, other).is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut ring = UmemRing::new(small()).unwrap();
        let desc = ring.alloc_tx().unwrap();
        ring.release(desc);
        ring.release(desc);
        assert_eq!(ring.free_frames(), 8);
    }
}
