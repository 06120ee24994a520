//! Static assignment of descriptors to worker threads.
//!
//! Worker ids are laid out as `[udp | xdp | quic]`. Each listening interface
//! records its descriptors per role together with the first thread id of the
//! XDP and QUIC ranges, so a worker can find what it owns from its id alone.

use crate::worker::Role;
use std::ops::Range;
use std::os::fd::RawFd;

/// Thread counts per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadPartition {
    /// Plain UDP workers
    pub udp: usize,
    /// XDP workers, one per ring
    pub xdp: usize,
    /// QUIC workers
    pub quic: usize,
}

impl ThreadPartition {
    /// Total worker count
    pub fn total(&self) -> usize {
        self.udp + self.xdp + self.quic
    }

    /// Thread ids assigned to `role`
    pub fn range(&self, role: Role) -> Range<usize> {
        match role {
            Role::Udp => 0..self.udp,
            Role::Xdp => self.udp..self.udp + self.xdp,
            Role::Quic => self.udp + self.xdp..self.total(),
        }
    }

    /// Role of `thread_id`, `None` past the last worker
    pub fn role_of(&self, thread_id: usize) -> Option<Role> {
        [Role::Udp, Role::Xdp, Role::Quic]
            .into_iter()
            .find(|&role| self.range(role).contains(&thread_id))
    }
}

/// Descriptors of one listening interface
#[derive(Debug, Clone, Default)]
pub struct IfaceDescriptor {
    /// Plain UDP sockets; one per UDP worker with reuseport, else one shared
    pub udp_fds: Vec<RawFd>,
    /// QUIC sockets; one per QUIC worker with reuseport, else one shared
    pub quic_fds: Vec<RawFd>,
    /// XDP ring descriptors, one per XDP worker
    pub xdp_fds: Vec<RawFd>,
    /// Thread id owning `xdp_fds[0]`
    pub xdp_first_thread_id: usize,
    /// Thread id owning `quic_fds[0]`
    pub quic_first_thread_id: usize,
    /// Number of QUIC workers serving this interface
    pub quic_threads: usize,
}

impl IfaceDescriptor {
    /// Descriptor that `thread_id` serves on this interface for `role`
    pub fn fd_for(&self, thread_id: usize, role: Role, reuseport: bool) -> Option<RawFd> {
        match role {
            Role::Xdp => {
                let idx = thread_id.checked_sub(self.xdp_first_thread_id)?;
                self.xdp_fds.get(idx).copied()
            }
            Role::Quic => {
                let idx = thread_id.checked_sub(self.quic_first_thread_id)?;
                if self.quic_fds.is_empty() || idx >= self.quic_threads {
                    return None;
                }
                if reuseport {
                    self.quic_fds.get(idx).copied()
                } else {
                    self.quic_fds.first().copied()
                }
            }
            Role::Udp => {
                if reuseport {
                    self.udp_fds.get(thread_id).copied()
                } else {
                    self.udp_fds.first().copied()
                }
            }
        }
    }
}

/// Every descriptor `thread_id` must poll.
///
/// An XDP worker owns exactly one descriptor; it serves the first interface
/// whose XDP range contains its id.
pub fn thread_fds(
    ifaces: &[IfaceDescriptor],
    thread_id: usize,
    role: Role,
    reuseport: bool,
) -> Vec<RawFd> {
    let mut fds = ifaces
        .iter()
        .filter_map(|iface| iface.fd_for(thread_id, role, reuseport));
    match role {
        Role::Xdp => fds.next().into_iter().collect(),
        _ => fds.collect(),
    }
}
