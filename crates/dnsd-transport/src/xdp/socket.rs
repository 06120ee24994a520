//! AF_XDP sockets bound to a NIC queue.
//!
//! [`AfXdpRing`] registers an anonymous frame area as UMEM, maps the four
//! kernel rings (fill, completion, RX, TX) and binds to one queue of one
//! interface. Frames reach the socket only through an XDP program that
//! redirects into an `XSKMAP`; loading that program is left to the operator
//! (for example with `xdp-loader`). When the map is pinned, the socket
//! registers itself in it under its queue id.
//!
//! Frame ownership: every frame is either on the free list, in the fill
//! ring, in the RX ring, held by the worker, or in the TX/completion rings.
//! Completed transmissions and released frames return to the free list; the
//! fill ring is topped up from it while keeping a transmit reserve.

use super::umem::UmemConfig;
use super::{FrameDesc, XDP_BATCHLEN, XdpError, XdpRing};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace, warn};

/// Kernel ABI of `<linux/if_xdp.h>` and the bpf(2) commands used here
#[allow(dead_code)]
mod sys {
    pub const SOL_XDP: libc::c_int = 283;

    pub const XDP_MMAP_OFFSETS: libc::c_int = 1;
    pub const XDP_RX_RING: libc::c_int = 2;
    pub const XDP_TX_RING: libc::c_int = 3;
    pub const XDP_UMEM_REG: libc::c_int = 4;
    pub const XDP_UMEM_FILL_RING: libc::c_int = 5;
    pub const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

    pub const XDP_PGOFF_RX_RING: libc::off_t = 0;
    pub const XDP_PGOFF_TX_RING: libc::off_t = 0x8000_0000;
    pub const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x1_0000_0000;
    pub const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x1_8000_0000;

    pub const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
    pub const BPF_OBJ_GET: libc::c_long = 7;

    #[repr(C)]
    #[derive(Default)]
    pub struct SockaddrXdp {
        pub family: u16,
        pub flags: u16,
        pub ifindex: u32,
        pub queue_id: u32,
        pub shared_umem_fd: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct UmemReg {
        pub addr: u64,
        pub len: u64,
        pub chunk_size: u32,
        pub headroom: u32,
        pub flags: u32,
        pub tx_metadata_len: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RingOffset {
        pub producer: u64,
        pub consumer: u64,
        pub desc: u64,
        pub flags: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MmapOffsets {
        pub rx: RingOffset,
        pub tx: RingOffset,
        pub fr: RingOffset,
        pub cr: RingOffset,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct XdpDesc {
        pub addr: u64,
        pub len: u32,
        pub options: u32,
    }

    #[repr(C)]
    pub struct ObjGetAttr {
        pub pathname: u64,
        pub bpf_fd: u32,
        pub file_flags: u32,
    }

    #[repr(C)]
    pub struct MapUpdateAttr {
        pub map_fd: u32,
        pub pad: u32,
        pub key: u64,
        pub value: u64,
        pub flags: u64,
    }
}

fn sys_err(op: &'static str) -> XdpError {
    XdpError::Sys {
        op,
        source: io::Error::last_os_error(),
    }
}

/// Anonymous or ring mapping, unmapped on drop
struct Mmap {
    ptr: *mut u8,
    len: usize,
}

impl Mmap {
    fn anonymous(len: usize) -> Result<Self, XdpError> {
        // SAFETY: anonymous private mapping; the result is checked for MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(sys_err("mmap umem"));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn ring(fd: RawFd, len: usize, pgoff: libc::off_t) -> Result<Self, XdpError> {
        // SAFETY: shared mapping of a ring the kernel sized for this socket.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(sys_err("mmap ring"));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// One kernel-shared ring of `T` entries
struct KernelRing<T> {
    _map: Mmap,
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    entries: *mut T,
    mask: u32,
    size: u32,
    /// Producer index not yet published (producer side) or last seen (consumer side)
    prod: u32,
    /// Consumer index not yet published (consumer side) or last seen (producer side)
    cons: u32,
}

impl<T: Copy> KernelRing<T> {
    fn map(fd: RawFd, off: &sys::RingOffset, size: u32, pgoff: libc::off_t) -> Result<Self, XdpError> {
        let len = off.desc as usize + size as usize * size_of::<T>();
        let map = Mmap::ring(fd, len, pgoff)?;
        // SAFETY: the kernel reports the offsets inside the mapping it sized.
        let (producer, consumer, entries) = unsafe {
            (
                map.ptr.add(off.producer as usize) as *const AtomicU32,
                map.ptr.add(off.consumer as usize) as *const AtomicU32,
                map.ptr.add(off.desc as usize) as *mut T,
            )
        };
        let mut ring = Self {
            _map: map,
            producer,
            consumer,
            entries,
            mask: size - 1,
            size,
            prod: 0,
            cons: 0,
        };
        ring.prod = ring.producer().load(Ordering::Acquire);
        ring.cons = ring.consumer().load(Ordering::Acquire);
        Ok(ring)
    }

    fn producer(&self) -> &AtomicU32 {
        // SAFETY: points into `self._map`, which lives as long as `self`.
        unsafe { &*self.producer }
    }

    fn consumer(&self) -> &AtomicU32 {
        // SAFETY: points into `self._map`, which lives as long as `self`.
        unsafe { &*self.consumer }
    }

    /// Producer side: slots that can still be written
    fn free(&mut self) -> u32 {
        self.cons = self.consumer().load(Ordering::Acquire);
        self.size - self.prod.wrapping_sub(self.cons)
    }

    /// Producer side: write one entry; visible after [`publish`](Self::publish)
    fn push(&mut self, entry: T) -> bool {
        if self.free() == 0 {
            return false;
        }
        // SAFETY: the slot index is masked into the mapped entry array.
        unsafe {
            self.entries.add((self.prod & self.mask) as usize).write(entry);
        }
        self.prod = self.prod.wrapping_add(1);
        true
    }

    fn publish(&self) {
        self.producer().store(self.prod, Ordering::Release);
    }

    /// Consumer side: read one entry; handed back after [`release`](Self::release)
    fn pop(&mut self) -> Option<T> {
        let prod = self.producer().load(Ordering::Acquire);
        if prod == self.cons {
            return None;
        }
        // SAFETY: the slot index is masked into the mapped entry array.
        let entry = unsafe { self.entries.add((self.cons & self.mask) as usize).read() };
        self.cons = self.cons.wrapping_add(1);
        Some(entry)
    }

    fn release(&self) {
        self.consumer().store(self.cons, Ordering::Release);
    }
}

fn setsockopt<T>(fd: RawFd, name: libc::c_int, value: &T, op: &'static str) -> Result<(), XdpError> {
    // SAFETY: `value` is a live `T` of the length passed.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            sys::SOL_XDP,
            name,
            (value as *const T).cast(),
            size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(sys_err(op));
    }
    Ok(())
}

fn interface_index(name: &str) -> Result<u32, XdpError> {
    let cname = CString::new(name).map_err(|_| XdpError::NoSuchInterface(name.to_string()))?;
    // SAFETY: cname is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(XdpError::NoSuchInterface(name.to_string()));
    }
    Ok(index)
}

fn bpf(cmd: libc::c_long, attr: *const libc::c_void, size: usize) -> libc::c_long {
    // SAFETY: attr points to a live bpf_attr prefix of `size` bytes.
    unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size as libc::c_uint) }
}

/// Insert `fd` into the pinned `XSKMAP` at `map` under `queue`
fn register_in_map(map: &Path, queue: u32, fd: RawFd) -> Result<(), XdpError> {
    let path = CString::new(map.as_os_str().as_bytes())
        .map_err(|_| XdpError::InvalidConfig(format!("bad map path {}", map.display())))?;
    let get = sys::ObjGetAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };
    let map_fd = bpf(sys::BPF_OBJ_GET, (&get as *const sys::ObjGetAttr).cast(), size_of::<sys::ObjGetAttr>());
    if map_fd < 0 {
        return Err(sys_err("open XSKMAP"));
    }
    // SAFETY: bpf(BPF_OBJ_GET) returned a new descriptor owned by nothing else.
    let map_fd = unsafe { OwnedFd::from_raw_fd(map_fd as RawFd) };

    let key = queue;
    let value = fd as u32;
    let update = sys::MapUpdateAttr {
        map_fd: map_fd.as_raw_fd() as u32,
        pad: 0,
        key: &key as *const u32 as u64,
        value: &value as *const u32 as u64,
        flags: 0,
    };
    if bpf(
        sys::BPF_MAP_UPDATE_ELEM,
        (&update as *const sys::MapUpdateAttr).cast(),
        size_of::<sys::MapUpdateAttr>(),
    ) < 0
    {
        return Err(sys_err("update XSKMAP"));
    }
    Ok(())
}

/// XDP socket on one interface queue
pub struct AfXdpRing {
    fd: OwnedFd,
    ifname: String,
    queue: u32,
    config: UmemConfig,
    rx: KernelRing<sys::XdpDesc>,
    tx: KernelRing<sys::XdpDesc>,
    fill: KernelRing<u64>,
    comp: KernelRing<u64>,
    area: Mmap,
    free: Vec<u64>,
}

// SAFETY: the mappings are owned by this value and touched only through
// `&mut self`; an XDP ring is driven by a single worker thread.
unsafe impl Send for AfXdpRing {}

impl AfXdpRing {
    /// Create the UMEM and rings and bind to `queue` of `ifname`.
    ///
    /// With `xsks_map`, the socket is also inserted into that pinned map.
    pub fn open(
        ifname: &str,
        queue: u32,
        config: UmemConfig,
        xsks_map: Option<&Path>,
    ) -> Result<Self, XdpError> {
        config.validate()?;
        let ifindex = interface_index(ifname)?;

        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(sys_err("socket(AF_XDP)"));
        }
        // SAFETY: raw was just created and is owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let sock = fd.as_raw_fd();

        let area_len = config.frame_count as usize * config.frame_size;
        let area = Mmap::anonymous(area_len)?;
        let reg = sys::UmemReg {
            addr: area.ptr as u64,
            len: area_len as u64,
            chunk_size: config.frame_size as u32,
            ..sys::UmemReg::default()
        };
        setsockopt(sock, sys::XDP_UMEM_REG, &reg, "register UMEM")?;
        let size = config.ring_size;
        setsockopt(sock, sys::XDP_UMEM_FILL_RING, &size, "size fill ring")?;
        setsockopt(sock, sys::XDP_UMEM_COMPLETION_RING, &size, "size completion ring")?;
        setsockopt(sock, sys::XDP_RX_RING, &size, "size RX ring")?;
        setsockopt(sock, sys::XDP_TX_RING, &size, "size TX ring")?;

        let mut off = sys::MmapOffsets::default();
        let mut optlen = size_of::<sys::MmapOffsets>() as libc::socklen_t;
        // SAFETY: `off` is a live MmapOffsets of `optlen` bytes.
        let ret = unsafe {
            libc::getsockopt(
                sock,
                sys::SOL_XDP,
                sys::XDP_MMAP_OFFSETS,
                (&mut off as *mut sys::MmapOffsets).cast(),
                &mut optlen,
            )
        };
        if ret != 0 {
            return Err(sys_err("read ring offsets"));
        }

        let rx = KernelRing::map(sock, &off.rx, size, sys::XDP_PGOFF_RX_RING)?;
        let tx = KernelRing::map(sock, &off.tx, size, sys::XDP_PGOFF_TX_RING)?;
        let fill = KernelRing::map(sock, &off.fr, size, sys::XDP_UMEM_PGOFF_FILL_RING)?;
        let comp = KernelRing::map(sock, &off.cr, size, sys::XDP_UMEM_PGOFF_COMPLETION_RING)?;

        let addr = sys::SockaddrXdp {
            family: libc::AF_XDP as u16,
            ifindex,
            queue_id: queue,
            ..sys::SockaddrXdp::default()
        };
        // SAFETY: `addr` is a live sockaddr_xdp of the length passed.
        let ret = unsafe {
            libc::bind(
                sock,
                (&addr as *const sys::SockaddrXdp).cast(),
                size_of::<sys::SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(sys_err("bind XDP socket"));
        }

        let frame_size = config.frame_size as u64;
        let free = (0..u64::from(config.frame_count)).rev().map(|i| i * frame_size).collect();
        let mut ring = Self {
            fd,
            ifname: ifname.to_string(),
            queue,
            config,
            rx,
            tx,
            fill,
            comp,
            area,
            free,
        };
        ring.refill();

        if let Some(map) = xsks_map {
            register_in_map(map, queue, sock)?;
            debug!("XDP socket {}/{} registered in {}", ifname, queue, map.display());
        }
        info!(
            "XDP socket bound to {} queue {} ({} frames)",
            ring.ifname, ring.queue, ring.config.frame_count
        );
        Ok(ring)
    }

    /// Interface name
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Queue id
    pub fn queue(&self) -> u32 {
        self.queue
    }

    fn base(&self, addr: u64) -> u64 {
        addr - addr % self.config.frame_size as u64
    }

    fn in_frame(&self, desc: FrameDesc) -> Option<usize> {
        let start = usize::try_from(desc.addr).ok()?;
        let end = start.checked_add(desc.len as usize)?;
        let frame_end = self.base(desc.addr) as usize + self.config.frame_size;
        (end <= frame_end && end <= self.area.len).then_some(start)
    }

    /// Collect finished transmissions
    fn complete(&mut self) {
        let mut done = 0;
        while let Some(addr) = self.comp.pop() {
            let base = self.base(addr);
            self.free.push(base);
            done += 1;
        }
        if done > 0 {
            self.comp.release();
        }
    }

    /// Give free frames to the kernel for reception, keeping a TX reserve
    fn refill(&mut self) {
        let mut pushed = 0;
        while self.free.len() > XDP_BATCHLEN {
            let Some(base) = self.free.pop() else {
                break;
            };
            if !self.fill.push(base) {
                self.free.push(base);
                break;
            }
            pushed += 1;
        }
        if pushed > 0 {
            self.fill.publish();
        }
    }

    fn kick(&self) {
        // SAFETY: zero-length sendto on an XDP socket only wakes the TX path.
        let ret = unsafe {
            libc::sendto(self.fd.as_raw_fd(), ptr::null(), 0, libc::MSG_DONTWAIT, ptr::null(), 0)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ENOBUFS) | Some(libc::ENETDOWN) => {
                    trace!("XDP TX kick on {}: {}", self.ifname, err)
                }
                _ => warn!("XDP TX kick on {} failed: {}", self.ifname, err),
            }
        }
    }
}

impl XdpRing for AfXdpRing {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn recv(&mut self, out: &mut [FrameDesc]) -> io::Result<usize> {
        self.complete();
        let mut n = 0;
        while n < out.len() {
            let Some(desc) = self.rx.pop() else {
                break;
            };
            out[n] = FrameDesc {
                addr: desc.addr,
                len: desc.len,
            };
            n += 1;
        }
        if n > 0 {
            self.rx.release();
        }
        self.refill();
        Ok(n)
    }

    fn alloc_tx(&mut self) -> Option<FrameDesc> {
        let base = self.free.pop()?;
        Some(FrameDesc {
            addr: base + self.config.headroom as u64,
            len: self.config.frame_capacity() as u32,
        })
    }

    fn frame_pair(&mut self, rx: FrameDesc, tx: FrameDesc) -> Option<(&[u8], &mut [u8])> {
        let rx_start = self.in_frame(rx)?;
        let tx_start = self.in_frame(tx)?;
        if self.base(rx.addr) == self.base(tx.addr) {
            return None;
        }
        // SAFETY: both ranges lie inside the area and in different frames,
        // so they do not overlap; the borrows are tied to `&mut self`.
        unsafe {
            Some((
                std::slice::from_raw_parts(self.area.ptr.add(rx_start), rx.len as usize),
                std::slice::from_raw_parts_mut(self.area.ptr.add(tx_start), tx.len as usize),
            ))
        }
    }

    fn send(&mut self, frames: &[FrameDesc]) -> io::Result<usize> {
        let mut queued = 0;
        for &desc in frames {
            let entry = sys::XdpDesc {
                addr: desc.addr,
                len: desc.len,
                options: 0,
            };
            if self.in_frame(desc).is_some() && self.tx.push(entry) {
                queued += 1;
            } else {
                self.release(desc);
            }
        }
        if queued > 0 {
            self.tx.publish();
            self.kick();
        }
        Ok(queued)
    }

    fn release(&mut self, desc: FrameDesc) {
        let base = self.base(desc.addr);
        if base < self.area.len as u64 && self.free.len() < self.config.frame_count as usize {
            self.free.push(base);
        }
    }

    fn sweep(&mut self) {
        self.complete();
        self.refill();
    }
}

impl Drop for AfXdpRing {
    fn drop(&mut self) {
        debug!("XDP socket {}/{} closed", self.ifname, self.queue);
    }
}
