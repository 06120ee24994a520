//! Worker threads.
//!
//! Each worker is an OS thread with a fixed role, a fixed set of descriptors
//! and its own query layer, arena and backend buffers. Workers share nothing
//! on the packet path; they only publish counters and watch a cancel flag.

use crate::backend::{Backend, BackendKind, PacketApi};
use crate::error::TransportError;
use crate::fdset::FdSet;
use crate::handler::UdpContext;
use crate::quic::QuicConfig;
use crate::xdp::XdpRing;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Wait timeout between cancellation checks
pub const POLL_TIMEOUT_MS: i32 = 1000;

/// Worker role, fixed at server start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Plain UDP sockets
    Udp,
    /// One XDP ring
    Xdp,
    /// QUIC sockets
    Quic,
}

impl Role {
    /// Backend serving this role
    pub fn backend(self) -> BackendKind {
        match self {
            Self::Udp => BackendKind::default_udp(),
            Self::Xdp => BackendKind::Xdp,
            Self::Quic => BackendKind::Quic,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Xdp => write!(f, "XDP"),
            Self::Quic => write!(f, "QUIC"),
        }
    }
}

/// Worker thread statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Datagrams handed to the query layer
    pub received: AtomicU64,
    /// Replies sent
    pub sent: AtomicU64,
    /// Datagrams left unanswered
    pub dropped: AtomicU64,
    /// Receive, send and wait errors
    pub errors: AtomicU64,
}

/// Server-wide statistics
#[derive(Debug)]
pub struct ServerStats {
    workers: Vec<Arc<WorkerStats>>,
    start_time: Instant,
}

impl ServerStats {
    /// Aggregate `workers`, counting uptime from now
    pub fn new(workers: Vec<Arc<WorkerStats>>) -> Self {
        Self {
            workers,
            start_time: Instant::now(),
        }
    }

    fn sum(&self, field: impl Fn(&WorkerStats) -> &AtomicU64) -> u64 {
        self.workers
            .iter()
            .map(|w| field(w).load(Ordering::Relaxed))
            .sum()
    }

    /// Per-worker counters, indexed by thread id
    pub fn workers(&self) -> &[Arc<WorkerStats>] {
        &self.workers
    }

    /// Total datagrams received
    pub fn total_received(&self) -> u64 {
        self.sum(|w| &w.received)
    }

    /// Total replies sent
    pub fn total_sent(&self) -> u64 {
        self.sum(|w| &w.sent)
    }

    /// Total unanswered datagrams
    pub fn total_dropped(&self) -> u64 {
        self.sum(|w| &w.dropped)
    }

    /// Total errors
    pub fn total_errors(&self) -> u64 {
        self.sum(|w| &w.errors)
    }

    /// Time since the workers started
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Received datagrams per second since start
    pub fn packets_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_received() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Everything a worker needs, computed once before it is spawned
pub struct WorkerSpec {
    /// Worker thread id
    pub thread_id: usize,
    /// Role
    pub role: Role,
    /// Core to pin to
    pub cpu: Option<usize>,
    /// Descriptors to poll
    pub fds: Vec<RawFd>,
    /// Ring of an XDP worker
    pub xdp_ring: Option<Box<dyn XdpRing>>,
    /// Backend to run
    pub backend: BackendKind,
}

impl WorkerSpec {
    /// Worker for `thread_id` with the role's default backend and core
    pub fn new(
        thread_id: usize,
        role: Role,
        fds: Vec<RawFd>,
        xdp_ring: Option<Box<dyn XdpRing>>,
    ) -> Self {
        Self {
            thread_id,
            role,
            cpu: cpu_for(thread_id),
            fds,
            xdp_ring,
            backend: role.backend(),
        }
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("thread_id", &self.thread_id)
            .field("role", &self.role)
            .field("cpu", &self.cpu)
            .field("fds", &self.fds)
            .field("xdp_ring", &self.xdp_ring.is_some())
            .field("backend", &self.backend)
            .finish()
    }
}

/// Core for `thread_id`, round robin; `None` on single-core systems
pub fn cpu_for(thread_id: usize) -> Option<usize> {
    let cpus = num_cpus::get();
    (cpus > 1).then_some(thread_id % cpus)
}

/// Run one worker until `cancel` is set.
///
/// Waits on the worker's descriptors, and for each ready one receives,
/// answers and sends. The backend is swept after every wait, including
/// timeouts.
pub fn udp_master(
    spec: WorkerSpec,
    mut ctx: UdpContext,
    quic: QuicConfig,
    cancel: Arc<AtomicBool>,
) -> Result<(), TransportError> {
    let thread_id = spec.thread_id;

    if let Some(cpu) = spec.cpu {
        match pin_to_cpu(cpu) {
            Ok(()) => debug!("Worker {} pinned to CPU {}", thread_id, cpu),
            Err(e) => warn!("Failed to pin worker {} to CPU {}: {}", thread_id, cpu, e),
        }
        if let Some(node) = crate::numa::get_numa_node_for_cpu(cpu) {
            debug!("Worker {} on NUMA node {}", thread_id, node);
        }
    }

    if spec.fds.is_empty() {
        return Err(TransportError::NoDescriptors {
            thread_id,
            role: spec.role,
        });
    }
    let mut fdset = FdSet::new();
    for &fd in &spec.fds {
        fdset.add(fd);
    }

    let mut backend = match Backend::init(spec.backend, spec.xdp_ring, &quic) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Worker {} backend {} init failed: {}", thread_id, spec.backend, e);
            return Err(e);
        }
    };
    debug!(
        thread_id,
        role = %spec.role,
        backend = %backend.kind(),
        fds = fdset.len(),
        "Worker started"
    );

    let stats = Arc::clone(ctx.stats());
    while !cancel.load(Ordering::Acquire) {
        let ready = match fdset.poll(POLL_TIMEOUT_MS) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Worker {} wait failed: {}", thread_id, e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        };

        if ready > 0 {
            for fd in fdset.ready() {
                match backend.recv(fd) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Worker {} receive failed: {}", thread_id, e);
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                backend.handle(&mut ctx);
                match backend.send() {
                    Ok(sent) => {
                        stats.sent.fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!("Worker {} send failed: {}", thread_id, e);
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        backend.sweep();
    }

    info!(
        "Worker {} ({}) shutting down (received {}, sent {}, dropped {}, errors {})",
        thread_id,
        spec.role,
        stats.received.load(Ordering::Relaxed),
        stats.sent.load(Ordering::Relaxed),
        stats.dropped.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed)
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(core_id: usize) -> std::io::Result<()> {
    use std::mem;

    // SAFETY: cpu_set_t is zero-initialized and filled with the libc macros;
    // pid 0 means the calling thread and the size matches cpu_set_t.
    let ret = unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core_id, &mut cpuset);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset)
    };

    if ret != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_core_id: usize) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{query, test_zones};
    use dnsd_core::wire::rtype;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_role_backend() {
        assert_eq!(Role::Udp.backend(), BackendKind::default_udp());
        assert_eq!(Role::Xdp.backend(), BackendKind::Xdp);
        assert_eq!(Role::Quic.backend(), BackendKind::Quic);
        assert_eq!(Role::Quic.to_string(), "QUIC");
    }

    #[test]
    fn test_cpu_for() {
        match cpu_for(5) {
            Some(cpu) => assert!(cpu < num_cpus::get()),
            None => assert_eq!(num_cpus::get(), 1),
        }
    }

    #[test]
    fn test_server_stats_totals() {
        let a = Arc::new(WorkerStats::default());
        let b = Arc::new(WorkerStats::default());
        a.received.store(10, Ordering::Relaxed);
        b.received.store(5, Ordering::Relaxed);
        a.sent.store(9, Ordering::Relaxed);
        b.dropped.store(2, Ordering::Relaxed);
        let stats = ServerStats::new(vec![a, b]);
        assert_eq!(stats.total_received(), 15);
        assert_eq!(stats.total_sent(), 9);
        assert_eq!(stats.total_dropped(), 2);
        assert_eq!(stats.total_errors(), 0);
        assert_eq!(stats.workers().len(), 2);
    }

    #[test]
    fn test_no_descriptors() {
        let ctx = UdpContext::new(test_zones(), 0, 1232, Arc::default());
        let spec = WorkerSpec::new(0, Role::Udp, Vec::new(), None);
        let err = udp_master(spec, ctx, QuicConfig::default(), Arc::default()).unwrap_err();
        assert!(matches!(
            err,
            TransportError::NoDescriptors {
                thread_id: 0,
                role: Role::Udp
            }
        ));
    }

    #[test]
    fn test_udp_master_answers_and_stops() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = Arc::new(WorkerStats::default());
        let cancel = Arc::new(AtomicBool::new(false));

        let spec = WorkerSpec::new(0, Role::Udp, vec![server.as_raw_fd()], None);
        let ctx = UdpContext::new(test_zones(), 0, 1232, Arc::clone(&stats));
        let worker = {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || udp_master(spec, ctx, QuicConfig::default(), cancel))
        };

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .send_to(&query(0x4242, "www.example.com.", rtype::A), addr)
            .unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(from, addr);
        assert!(n > 12);
        assert_eq!(&buf[..2], &[0x42, 0x42]);

        cancel.store(true, Ordering::Release);
        worker.join().unwrap().unwrap();
        assert_eq!(stats.received.load(Ordering::Relaxed), 1);
        assert_eq!(stats.sent.load(Ordering::Relaxed), 1);
        drop(server);
    }
}
