//! Batched datagram backend over `recvmmsg`/`sendmmsg` (Linux).
//!
//! One receive call collects up to [`RECVMMSG_BATCHLEN`] datagrams; each is
//! answered in order and the replies leave in a single `sendmmsg`. Queries
//! that must not be answered are left out of the send vector entirely.

use super::addr::{STORAGE_LEN, empty_storage, from_storage, local_addr, to_storage};
use super::pktinfo::{CmsgBuf, Pktinfo, read_pktinfo, write_pktinfo};
use crate::handler::UdpContext;
use dnsd_core::MAX_PKTSIZE;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Datagrams per receive call
pub const RECVMMSG_BATCHLEN: usize = 10;

const N: usize = RECVMMSG_BATCHLEN;

/// Batch buffers and kernel message vectors for one worker
pub struct Recvmmsg {
    fd: RawFd,
    rcvd: usize,
    rx: Box<[u8]>,
    tx: Box<[u8]>,
    rx_len: [usize; N],
    tx_len: [usize; N],
    addrs: [libc::sockaddr_storage; N],
    remotes: [Option<SocketAddr>; N],
    pktinfo: [Option<Pktinfo>; N],
    cmsg: [CmsgBuf; N],
    iov: [libc::iovec; N],
    msgs: [libc::mmsghdr; N],
    out_addrs: [libc::sockaddr_storage; N],
    out_cmsg: [CmsgBuf; N],
    out_iov: [libc::iovec; N],
    out: [libc::mmsghdr; N],
    local: Option<(RawFd, Option<SocketAddr>)>,
}

fn empty_iov() -> libc::iovec {
    libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }
}

fn empty_mmsghdr() -> libc::mmsghdr {
    // SAFETY: mmsghdr is plain old data; all-zero is a valid value.
    unsafe { std::mem::zeroed() }
}

impl Recvmmsg {
    /// Allocate buffers for a full batch in each direction
    pub fn new() -> Self {
        Self {
            fd: -1,
            rcvd: 0,
            rx: vec![0u8; N * MAX_PKTSIZE].into_boxed_slice(),
            tx: vec![0u8; N * MAX_PKTSIZE].into_boxed_slice(),
            rx_len: [0; N],
            tx_len: [0; N],
            addrs: [empty_storage(); N],
            remotes: [None; N],
            pktinfo: [None; N],
            cmsg: [CmsgBuf::new(); N],
            iov: [empty_iov(); N],
            msgs: [empty_mmsghdr(); N],
            out_addrs: [empty_storage(); N],
            out_cmsg: [CmsgBuf::new(); N],
            out_iov: [empty_iov(); N],
            out: [empty_mmsghdr(); N],
            local: None,
        }
    }

    /// Datagrams held from the last receive
    pub fn received(&self) -> usize {
        self.rcvd
    }

    /// Replies waiting to be sent
    pub fn pending_replies(&self) -> usize {
        self.tx_len[..self.rcvd].iter().filter(|&&len| len > 0).count()
    }

    fn reset(&mut self) {
        self.rcvd = 0;
        self.rx_len = [0; N];
        self.tx_len = [0; N];
        self.remotes = [None; N];
        self.pktinfo = [None; N];
    }

    /// Receive up to a batch of datagrams from `fd` without blocking
    pub fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        self.reset();

        for k in 0..N {
            self.iov[k] = libc::iovec {
                iov_base: self.rx[k * MAX_PKTSIZE..].as_mut_ptr().cast(),
                iov_len: MAX_PKTSIZE,
            };
            self.addrs[k] = empty_storage();
            self.msgs[k] = empty_mmsghdr();
            let hdr = &mut self.msgs[k].msg_hdr;
            hdr.msg_name = (&mut self.addrs[k] as *mut libc::sockaddr_storage).cast();
            hdr.msg_namelen = STORAGE_LEN;
            hdr.msg_iov = &mut self.iov[k];
            hdr.msg_iovlen = 1;
            hdr.msg_control = self.cmsg[k].as_mut_ptr();
            hdr.msg_controllen = self.cmsg[k].0.len() as _;
        }

        // SAFETY: each message header points at live buffers owned by self
        // with the stated lengths; the kernel writes at most N entries.
        let ret = unsafe {
            libc::recvmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                N as _,
                libc::MSG_DONTWAIT as _,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }

        let n = (ret as usize).min(N);
        self.fd = fd;
        self.rcvd = n;
        for i in 0..n {
            let hdr = &self.msgs[i].msg_hdr;
            self.rx_len[i] = self.msgs[i].msg_len as usize;
            self.remotes[i] = from_storage(&self.addrs[i], hdr.msg_namelen);
            // SAFETY: the control buffer of message i was filled by recvmmsg.
            self.pktinfo[i] = unsafe { read_pktinfo(hdr) };
        }
        Ok(n)
    }

    fn bound_addr(&mut self) -> Option<SocketAddr> {
        match self.local {
            Some((fd, addr)) if fd == self.fd => addr,
            _ => {
                let addr = local_addr(self.fd);
                self.local = Some((self.fd, addr));
                addr
            }
        }
    }

    /// Answer every received datagram, in order
    pub fn handle(&mut self, ctx: &mut UdpContext) {
        let bound = self.bound_addr();
        for i in 0..self.rcvd {
            let Some(remote) = self.remotes[i] else {
                self.tx_len[i] = 0;
                continue;
            };
            let local = match (self.pktinfo[i], bound) {
                (Some(info), Some(bound)) => Some(SocketAddr::new(info.local_ip(), bound.port())),
                (_, bound) => bound,
            };
            let slot = i * MAX_PKTSIZE;
            self.tx_len[i] = ctx.handle(
                Some(self.fd),
                remote,
                local,
                &self.rx[slot..slot + self.rx_len[i]],
                &mut self.tx[slot..slot + MAX_PKTSIZE],
            );
        }
    }

    /// Send all non-empty replies in one batch.
    ///
    /// Returns the number of datagrams handed to the kernel. Buffer lengths
    /// are reset afterwards whatever the outcome.
    pub fn send(&mut self) -> io::Result<usize> {
        let mut count = 0;
        for i in 0..self.rcvd {
            if self.tx_len[i] == 0 {
                continue;
            }
            let Some(remote) = self.remotes[i] else {
                continue;
            };

            let namelen = to_storage(&remote, &mut self.out_addrs[count]);
            self.out_iov[count] = libc::iovec {
                iov_base: self.tx[i * MAX_PKTSIZE..].as_mut_ptr().cast(),
                iov_len: self.tx_len[i],
            };
            self.out[count] = empty_mmsghdr();
            let hdr = &mut self.out[count].msg_hdr;
            hdr.msg_name = (&mut self.out_addrs[count] as *mut libc::sockaddr_storage).cast();
            hdr.msg_namelen = namelen;
            hdr.msg_iov = &mut self.out_iov[count];
            hdr.msg_iovlen = 1;
            if let Some(info) = self.pktinfo[i] {
                write_pktinfo(&info.for_reply(), hdr, &mut self.out_cmsg[count]);
            }
            count += 1;
        }

        let mut sent = 0;
        let mut result = Ok(());
        while sent < count {
            // SAFETY: entries sent..count were filled above and point at live
            // buffers owned by self.
            let ret = unsafe {
                libc::sendmmsg(
                    self.fd,
                    self.out[sent..].as_mut_ptr(),
                    (count - sent) as _,
                    0,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                result = Err(err);
                break;
            }
            if ret == 0 {
                break;
            }
            sent += ret as usize;
        }

        self.reset();
        result.map(|()| sent)
    }
}

impl Default for Recvmmsg {
    fn default() -> Self {
        Self::new()
    }
}
