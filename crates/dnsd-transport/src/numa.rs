//! NUMA topology lookup for worker placement logging.

#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use tracing::debug;

/// NUMA node a CPU core belongs to, read from sysfs
///
/// Returns `None` when the system exposes no NUMA topology.
#[cfg(target_os = "linux")]
pub fn get_numa_node_for_cpu(cpu: usize) -> Option<usize> {
    for node in 0..8 {
        let path = format!("/sys/devices/system/node/node{}/cpu{}", node, cpu);
        if fs::metadata(&path).is_ok() {
            return Some(node);
        }
    }

    if fs::metadata("/sys/devices/system/node/node0").is_ok() {
        debug!("CPU {} defaulting to NUMA node 0", cpu);
        Some(0)
    } else {
        None
    }
}

/// NUMA topology is not read on this platform
#[cfg(not(target_os = "linux"))]
pub fn get_numa_node_for_cpu(_cpu: usize) -> Option<usize> {
    None
}
