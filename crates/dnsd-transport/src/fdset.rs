//! Descriptor set waited on by a worker.

use std::io;
use std::os::fd::RawFd;

/// A set of descriptors polled for readability
pub struct FdSet {
    fds: Vec<libc::pollfd>,
}

impl FdSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    /// Watch `fd` for input
    pub fn add(&mut self, fd: RawFd) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }

    /// Number of watched descriptors
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// True when nothing is watched
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait up to `timeout_ms` for input.
    ///
    /// Returns the number of ready descriptors; an interrupted wait counts
    /// as a timeout.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<usize> {
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }
        // SAFETY: fds is a live array of pollfd with the given length.
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }

    /// Descriptors with pending input after the last [`poll`](Self::poll)
    pub fn ready(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds
            .iter()
            .filter(|pfd| pfd.revents & libc::POLLIN != 0)
            .map(|pfd| pfd.fd)
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}
