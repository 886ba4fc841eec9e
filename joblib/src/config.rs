use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// Per-job resource ceilings written into each job's cgroup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time allowed per `cpu_period_us`, in microseconds.
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub memory_max_bytes: u64,
    /// Read ceiling in bytes per second.
    pub io_read_bps: u64,
    /// Write ceiling in bytes per second.
    pub io_write_bps: u64,
    /// Block devices (`MAJ:MIN`) the I/O ceilings apply to. Empty means every
    /// whole disk the kernel reports.
    pub io_devices: Vec<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            // 1% of one core
            cpu_quota_us: 1_000,
            cpu_period_us: 100_000,
            memory_max_bytes: 1024 * 1024,
            io_read_bps: 10_000,
            io_write_bps: 5_000,
            io_devices: Vec::new(),
        }
    }
}

/// Engine-wide settings, fixed at coordinator start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Mount point of the unified cgroup hierarchy.
    pub cgroup_root: PathBuf,
    /// Directory under `cgroup_root` holding one cgroup per job.
    pub cgroup_group: String,
    pub limits: ResourceLimits,
    /// User the job command runs as. `None` keeps the server's credentials.
    pub run_as: Option<String>,
    /// Binary re-executed for the init stage. Defaults to the running executable.
    pub init_program: Option<PathBuf>,
    /// How long a graceful stop waits before escalating to SIGKILL.
    pub stop_grace_period_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_group: "joblib".to_string(),
            limits: ResourceLimits::default(),
            run_as: None,
            init_program: None,
            stop_grace_period_ms: 2_000,
        }
    }
}

impl JobConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}
