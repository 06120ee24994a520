//! Single-datagram backend over `recvmsg`/`sendmsg`.

use super::addr::{STORAGE_LEN, empty_storage, from_storage, local_addr, to_storage};
use super::pktinfo::{CmsgBuf, Pktinfo, read_pktinfo, write_pktinfo};
use crate::handler::UdpContext;
use dnsd_core::MAX_PKTSIZE;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// One receive buffer, one send buffer and the addressing of the datagram
/// currently being answered.
pub struct Recvfrom {
    fd: RawFd,
    rx: Box<[u8]>,
    tx: Box<[u8]>,
    rx_len: usize,
    tx_len: usize,
    remote: Option<SocketAddr>,
    pktinfo: Option<Pktinfo>,
    local: Option<(RawFd, Option<SocketAddr>)>,
    cmsg: CmsgBuf,
    reply_cmsg: CmsgBuf,
}

impl Recvfrom {
    /// Allocate the buffer pair
    pub fn new() -> Self {
        Self {
            fd: -1,
            rx: vec![0u8; MAX_PKTSIZE].into_boxed_slice(),
            tx: vec![0u8; MAX_PKTSIZE].into_boxed_slice(),
            rx_len: 0,
            tx_len: 0,
            remote: None,
            pktinfo: None,
            local: None,
            cmsg: CmsgBuf::new(),
            reply_cmsg: CmsgBuf::new(),
        }
    }

    /// Receive at most one datagram from `fd` without blocking.
    ///
    /// Returns the number of datagrams received; an empty socket yields 0.
    pub fn recv(&mut self, fd: RawFd) -> io::Result<usize> {
        self.rx_len = 0;
        self.tx_len = 0;
        self.remote = None;
        self.pktinfo = None;

        let mut storage = empty_storage();
        let mut iov = libc::iovec {
            iov_base: self.rx.as_mut_ptr().cast(),
            iov_len: self.rx.len(),
        };
        // SAFETY: msghdr is plain old data; all-zero is a valid value.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast();
        msg.msg_namelen = STORAGE_LEN;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = self.cmsg.as_mut_ptr();
        msg.msg_controllen = self.cmsg.0.len() as _;

        // SAFETY: every pointer in msg refers to a live buffer of the stated
        // length for the duration of the call.
        let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        if ret == 0 {
            return Ok(0);
        }

        self.fd = fd;
        self.rx_len = ret as usize;
        self.remote = from_storage(&storage, msg.msg_namelen);
        // SAFETY: the control buffer was filled by recvmsg above.
        self.pktinfo = unsafe { read_pktinfo(&msg) };
        Ok(usize::from(self.remote.is_some()))
    }

    /// Source address and payload of the received datagram
    pub fn received(&self) -> Option<(SocketAddr, &[u8])> {
        self.remote.map(|remote| (remote, &self.rx[..self.rx_len]))
    }

    /// Local address the datagram arrived on
    pub fn local(&mut self) -> Option<SocketAddr> {
        let bound = match self.local {
            Some((fd, addr)) if fd == self.fd => addr,
            _ => {
                let addr = local_addr(self.fd);
                self.local = Some((self.fd, addr));
                addr
            }
        };
        match (self.pktinfo, bound) {
            (Some(info), Some(bound)) => Some(SocketAddr::new(info.local_ip(), bound.port())),
            (_, bound) => bound,
        }
    }

    /// Run the received datagram through the query layer
    pub fn handle(&mut self, ctx: &mut UdpContext) {
        let Some(remote) = self.remote else {
            self.tx_len = 0;
            return;
        };
        let local = self.local();
        self.tx_len = ctx.handle(
            Some(self.fd),
            remote,
            local,
            &self.rx[..self.rx_len],
            &mut self.tx,
        );
    }

    /// Fill the send buffer directly; `write` returns the reply length
    pub fn stage_reply(&mut self, write: impl FnOnce(&mut [u8]) -> usize) {
        self.tx_len = write(&mut self.tx).min(self.tx.len());
    }

    /// Length of the pending reply
    pub fn reply_len(&self) -> usize {
        self.tx_len
    }

    /// Send the pending reply, if any, back to the sender.
    ///
    /// Returns the number of datagrams sent.
    pub fn send(&mut self) -> io::Result<usize> {
        let len = std::mem::take(&mut self.tx_len);
        let Some(remote) = self.remote else {
            return Ok(0);
        };
        if len == 0 {
            return Ok(0);
        }

        let mut storage = empty_storage();
        let namelen = to_storage(&remote, &mut storage);
        let mut iov = libc::iovec {
            iov_base: self.tx.as_mut_ptr().cast(),
            iov_len: len,
        };
        // SAFETY: msghdr is plain old data; all-zero is a valid value.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&mut storage as *mut libc::sockaddr_storage).cast();
        msg.msg_namelen = namelen;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some(info) = self.pktinfo {
            write_pktinfo(&info.for_reply(), &mut msg, &mut self.reply_cmsg);
        }

        // SAFETY: every pointer in msg refers to a live buffer of the stated
        // length for the duration of the call.
        let ret = unsafe { libc::sendmsg(self.fd, &msg, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(1)
    }
}

impl Default for Recvfrom {
    fn default() -> Self {
        Self::new()
    }
}
