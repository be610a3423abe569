use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tracing::debug;

/// Resource limits applied to every spawned program
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    pub cpu_time_s: u64,

    /// Maximum size of any file the program creates, in bytes
    pub max_file_size_bytes: u64,
}

impl ResourceLimits {
    /// Derives the CPU limit from the wall-clock limit, rounded up, plus slack.
    pub fn for_time_limit(time_limit: Duration, slack_s: u64, max_file_size_bytes: u64) -> Self {
        let secs = time_limit.as_secs() + u64::from(time_limit.subsec_nanos() > 0);
        Self {
            cpu_time_s: secs.max(1) + slack_s,
            max_file_size_bytes,
        }
    }
}

/// Applies the limits to the current process. Meant to run between fork and exec,
/// so it only calls async-signal-safe functions.
#[cfg(unix)]
pub fn apply_resource_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    set_limit(libc::RLIMIT_CPU, limits.cpu_time_s)?;
    set_limit(libc::RLIMIT_FSIZE, limits.max_file_size_bytes)?;
    // Core dumps would land in the scratch directory.
    set_limit(libc::RLIMIT_CORE, 0)?;
    Ok(())
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_resource_limits(_limits: &ResourceLimits) -> std::io::Result<()> {
    Ok(())
}

/// Snapshot of what one execution consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub elapsed_ms: u64,
    pub peak_memory_bytes: u64,
}

/// Keeps the most recent execution statistics for the service.
pub struct ResourceMonitor {
    latest: Mutex<ResourceStats>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(ResourceStats::default()),
        }
    }

    /// Starts timing a request from the moment it is admitted.
    pub fn track(&self) -> ExecutionTracker {
        ExecutionTracker::new()
    }

    pub fn record(&self, stats: ResourceStats) {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        *latest = stats;
    }

    pub fn snapshot(&self) -> ResourceStats {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-execution timer and memory high-water mark.
///
/// Memory is sampled whenever the sandbox gets a chance (spawn, output, idle ticks),
/// so short-lived programs may report little or nothing.
pub struct ExecutionTracker {
    started: Instant,
    peak_memory_bytes: u64,
    system: System,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            peak_memory_bytes: 0,
            system: System::new(),
        }
    }

    /// Reads the current resident memory of `pid` and folds it into the peak.
    pub fn sample(&mut self, pid: Option<u32>) -> Option<u64> {
        let pid = Pid::from_u32(pid?);
        if !self.system.refresh_process(pid) {
            return None;
        }
        let memory = self.system.process(pid)?.memory();
        self.observe_memory(memory);
        Some(memory)
    }

    pub fn observe_memory(&mut self, bytes: u64) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(bytes);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            elapsed_ms: self.elapsed().as_millis() as u64,
            peak_memory_bytes: self.peak_memory_bytes,
        }
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn print_resource_report(stats: &ResourceStats) {
    debug!("Resource usage report:");
    debug!("  Wall time used: {} ms", stats.elapsed_ms);
    debug!("  Peak memory usage: {} KB", stats.peak_memory_bytes / 1024);
}
