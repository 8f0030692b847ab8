//! cgroup resource directives.
//!
//! Each limit that is set maps to exactly one directive; unset limits emit
//! nothing so the backend default stays in force.

use lxcompose_common::types::Resources;

use crate::directive::Translation;

/// Emits the resource limit directives.
pub fn emit(resources: &Resources, out: &mut Translation) {
    if let Some(shares) = resources.cpu_shares {
        out.push("lxc.cgroup.cpu.shares", shares);
    }
    if let Some(quota) = resources.cpu_quota {
        out.push("lxc.cgroup.cpu.cfs_quota_us", quota);
    }
    if let Some(period) = resources.cpu_period {
        out.push("lxc.cgroup.cpu.cfs_period_us", period);
    }
    if let Some(cores) = resources.core_count {
        out.push("lxc.cgroup.cpuset.cpus", cpu_range(cores));
    }
    if let Some(limit) = resources.memory_limit {
        out.push("lxc.cgroup.memory.limit_in_bytes", limit);
    }
    if let Some(swap) = resources.memory_swap {
        out.push("lxc.cgroup.memory.memsw.limit_in_bytes", swap);
    }
}

/// Formats a cpuset covering the first `cores` CPUs.
fn cpu_range(cores: u32) -> String {
    match cores {
        0 | 1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    }
}
