//! IP_PKTINFO / IPV6_PKTINFO control messages.
//!
//! The destination address of a received datagram is carried in a control
//! message and copied onto the reply so that it leaves from the address the
//! query arrived on. The interface index is cleared on the way out so the
//! reply still follows the routing table.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Control buffer large enough for one `in6_pktinfo` message
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub(crate) struct CmsgBuf(pub(crate) [u8; 64]);

impl CmsgBuf {
    pub(crate) const fn new() -> Self {
        Self([0; 64])
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.0.as_mut_ptr().cast()
    }
}

impl Default for CmsgBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Packet information of one received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pktinfo {
    /// IPv4 packet information
    V4 {
        /// Interface the datagram arrived on
        ifindex: i32,
        /// Local address to answer from
        spec_dst: Ipv4Addr,
        /// Destination address of the datagram
        addr: Ipv4Addr,
    },
    /// IPv6 packet information
    V6 {
        /// Interface the datagram arrived on
        ifindex: u32,
        /// Destination address of the datagram
        addr: Ipv6Addr,
    },
}

impl Pktinfo {
    /// Information to attach to the reply.
    ///
    /// IPv4 answers from the query's destination address; both families
    /// clear the interface index.
    pub fn for_reply(self) -> Self {
        match self {
            Self::V4 { addr, .. } => Self::V4 {
                ifindex: 0,
                spec_dst: addr,
                addr,
            },
            Self::V6 { addr, .. } => Self::V6 { ifindex: 0, addr },
        }
    }

    /// Local address the datagram was sent to
    pub fn local_ip(&self) -> IpAddr {
        match self {
            Self::V4 { addr, .. } => IpAddr::V4(*addr),
            Self::V6 { addr, .. } => IpAddr::V6(*addr),
        }
    }
}

/// Find packet information in the control data of a received message.
///
/// # Safety
///
/// `msg.msg_control` and `msg.msg_controllen` must describe a valid control
/// buffer filled by the kernel.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn read_pktinfo(msg: &libc::msghdr) -> Option<Pktinfo> {
    if msg.msg_control.is_null() || msg.msg_controllen == 0 {
        return None;
    }

    // SAFETY: the caller guarantees the control buffer is valid; the CMSG
    // macros stay within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let info =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                return Some(Pktinfo::V4 {
                    ifindex: info.ipi_ifindex,
                    spec_dst: Ipv4Addr::from(u32::from_be(info.ipi_spec_dst.s_addr)),
                    addr: Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)),
                });
            }
            if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let info =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                return Some(Pktinfo::V6 {
                    ifindex: info.ipi6_ifindex,
                    addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
                });
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

/// Write `info` as the only control message of `msg`, using `buf` as the
/// control buffer.
#[cfg(target_os = "linux")]
pub(crate) fn write_pktinfo(info: &Pktinfo, msg: &mut libc::msghdr, buf: &mut CmsgBuf) {
    let (level, kind, data_len) = match info {
        Pktinfo::V4 { .. } => (
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            std::mem::size_of::<libc::in_pktinfo>(),
        ),
        Pktinfo::V6 { .. } => (
            libc::IPPROTO_IPV6,
            libc::IPV6_PKTINFO,
            std::mem::size_of::<libc::in6_pktinfo>(),
        ),
    };

    *buf = CmsgBuf::new();
    msg.msg_control = buf.as_mut_ptr();

    // SAFETY: buf is 64 aligned bytes, larger than CMSG_SPACE of either
    // pktinfo structure, and msg_control points at it.
    unsafe {
        msg.msg_controllen = libc::CMSG_SPACE(data_len as u32) as _;
        let cmsg = libc::CMSG_FIRSTHDR(msg);
        if cmsg.is_null() {
            msg.msg_control = std::ptr::null_mut();
            msg.msg_controllen = 0;
            return;
        }
        (*cmsg).cmsg_level = level;
        (*cmsg).cmsg_type = kind;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;

        let data = libc::CMSG_DATA(cmsg);
        match *info {
            Pktinfo::V4 {
                ifindex,
                spec_dst,
                addr,
            } => {
                let raw = libc::in_pktinfo {
                    ipi_ifindex: ifindex,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from(spec_dst).to_be(),
                    },
                    ipi_addr: libc::in_addr {
                        s_addr: u32::from(addr).to_be(),
                    },
                };
                std::ptr::write_unaligned(data.cast::<libc::in_pktinfo>(), raw);
            }
            Pktinfo::V6 { ifindex, addr } => {
                let raw = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: addr.octets(),
                    },
                    ipi6_ifindex: ifindex,
                };
                std::ptr::write_unaligned(data.cast::<libc::in6_pktinfo>(), raw);
            }
        }
    }
}

/// Ask the kernel to report packet information on `fd`
#[cfg(target_os = "linux")]
pub(crate) fn enable_pktinfo(fd: std::os::fd::RawFd, ipv6: bool) -> std::io::Result<()> {
    let on: libc::c_int = 1;
    let (level, name) = if ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
    } else {
        (libc::IPPROTO_IP, libc::IP_PKTINFO)
    };
    // SAFETY: setsockopt with a valid int option value and its exact size.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Packet information is not collected on this platform
#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn read_pktinfo(_msg: &libc::msghdr) -> Option<Pktinfo> {
    None
}

/// Packet information is not attached on this platform
#[cfg(not(target_os = "linux"))]
pub(crate) fn write_pktinfo(_info: &Pktinfo, msg: &mut libc::msghdr, _buf: &mut CmsgBuf) {
    msg.msg_control = std::ptr::null_mut();
    msg.msg_controllen = 0;
}

/// Packet information is not collected on this platform
#[cfg(not(target_os = "linux"))]
pub(crate) fn enable_pktinfo(_fd: std::os::fd::RawFd, _ipv6: bool) -> std::io::Result<()> {
    Ok(())
}
