use crate::config::ResourceLimits;
use crate::error::{Error, Result};
use crate::types::JobId;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONTROLLERS: [&str; 3] = ["cpu", "memory", "io"];
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_BACKOFF: Duration = Duration::from_millis(20);

/// The cgroup directory owned by one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates, configures and removes per-job cgroups (unified hierarchy).
///
/// Each job gets `<root>/<group>/<job id>`. Limits are written one controller at a time; a
/// controller the kernel does not expose is logged and skipped, only failing to create the
/// directory itself is fatal.
#[derive(Clone, Debug)]
pub struct CgroupManager {
    root: PathBuf,
    group: PathBuf,
}

impl CgroupManager {
    pub fn new(root: impl Into<PathBuf>, group: &str) -> Self {
        let root = root.into();
        let group = root.join(group);
        Self { root, group }
    }

    pub fn group_path(&self) -> &Path {
        &self.group
    }

    /// Create the group directory and delegate controllers to it, best effort.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.group).map_err(|source| Error::CgroupCreateFailed {
            path: self.group.clone(),
            source,
        })?;
        for dir in [&self.root, &self.group] {
            let enabled = enable_controllers(dir);
            tracing::debug!(path = %dir.display(), ?enabled, "delegated cgroup controllers");
        }
        Ok(())
    }

    /// Create the job's cgroup and apply `limits` to it.
    pub fn create(&self, job_id: &JobId, limits: &ResourceLimits) -> Result<CgroupHandle> {
        let path = self.group.join(job_id.to_string());
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(Error::CgroupCreateFailed { path, source }),
        }
        let handle = CgroupHandle { path };
        for err in self.apply_limits(&handle, limits) {
            tracing::warn!(%job_id, error = %err, "skipping cgroup limit");
        }
        Ok(handle)
    }

    /// Write every limit, returning the controllers that could not be configured.
    pub(crate) fn apply_limits(&self, handle: &CgroupHandle, limits: &ResourceLimits) -> Vec<Error> {
        let mut skipped = vec![];

        let cpu_max = format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us);
        if let Err(source) = write_control(&handle.path, "cpu.max", &cpu_max) {
            skipped.push(Error::CgroupUnsupported {
                controller: "cpu",
                source,
            });
        }

        if let Err(source) = write_control(
            &handle.path,
            "memory.max",
            &limits.memory_max_bytes.to_string(),
        ) {
            skipped.push(Error::CgroupUnsupported {
                controller: "memory",
                source,
            });
        }

        let devices = if limits.io_devices.is_empty() {
            block_devices()
        } else {
            limits.io_devices.clone()
        };
        for device in devices {
            let io_max = format!(
                "{} rbps={} wbps={}",
                device, limits.io_read_bps, limits.io_write_bps
            );
            if let Err(source) = write_control(&handle.path, "io.max", &io_max) {
                skipped.push(Error::CgroupUnsupported {
                    controller: "io",
                    source,
                });
            }
        }

        skipped
    }

    /// Move `pid` into the job's cgroup.
    pub fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        write_control(&handle.path, "cgroup.procs", &pid.to_string()).map_err(|source| {
            Error::Cgroup {
                path: handle.path.clone(),
                source,
            }
        })
    }

    /// Remove the job's cgroup. Removing an already removed cgroup succeeds.
    pub fn remove(&self, handle: &CgroupHandle) -> Result<()> {
        match fs::remove_dir(&handle.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Cgroup {
                path: handle.path.clone(),
                source,
            }),
        }
    }

    /// Remove the job's cgroup, retrying while the kernel still reports it busy. The last
    /// processes of a job can linger briefly after the job itself was reaped.
    pub async fn remove_when_empty(&self, handle: &CgroupHandle) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.remove(handle) {
                Err(err) if attempt < REMOVE_ATTEMPTS => {
                    tracing::debug!(path = %handle.path.display(), attempt, error = %err, "cgroup busy, retrying");
                    tokio::time::sleep(REMOVE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Remove the group directory once every job cgroup inside it is gone.
    pub fn teardown(&self) -> Result<()> {
        self.remove(&CgroupHandle {
            path: self.group.clone(),
        })
    }
}

/// Write one value to an existing control file. Control files are never created here: a
/// missing file means the controller is not available.
fn write_control(dir: &Path, file: &str, value: &str) -> io::Result<()> {
    let mut control = OpenOptions::new().write(true).open(dir.join(file))?;
    control.write_all(value.as_bytes())
}

/// Enable each controller for `dir`'s children with a write of its own. The kernel rejects
/// a combined write outright if any one controller is unavailable.
fn enable_controllers(dir: &Path) -> Vec<&'static str> {
    let available = fs::read_to_string(dir.join("cgroup.controllers")).ok();
    let mut enabled = vec![];
    for controller in CONTROLLERS {
        if let Some(available) = &available {
            if !available.split_whitespace().any(|c| c == controller) {
                tracing::warn!(path = %dir.display(), controller, "cgroup controller not available");
                continue;
            }
        }
        match write_control(dir, "cgroup.subtree_control", &format!("+{}", controller)) {
            Ok(()) => enabled.push(controller),
            Err(err) => {
                tracing::warn!(path = %dir.display(), controller, error = %err, "could not enable cgroup controller")
            }
        }
    }
    enabled
}

/// `MAJ:MIN` of every whole disk, skipping loop and ram devices.
fn block_devices() -> Vec<String> {
    let entries = match fs::read_dir("/sys/block") {
        Ok(entries) => entries,
        Err(_) => return vec![],
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            !name.starts_with("loop") && !name.starts_with("ram")
        })
        .filter_map(|entry| fs::read_to_string(entry.path().join("dev")).ok())
        .map(|dev| dev.trim().to_string())
        .filter(|dev| !dev.is_empty())
        .collect()
}
