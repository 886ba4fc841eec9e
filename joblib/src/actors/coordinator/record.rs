use crate::actors::worker::WorkerHandle;
use crate::broadcaster::Broadcaster;
use crate::cgroup::CgroupHandle;
use crate::events::JobStatus;
use crate::types::{Args, JobId, JobInfo, Principal};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::sync::watch;

/// Everything the coordinator knows about one job. Records live until shutdown.
pub struct JobRecord {
    pub job_id: JobId,
    pub owner: Principal,
    pub program: PathBuf,
    pub args: Args,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub status: watch::Receiver<JobStatus>,
    pub output: Broadcaster,
    pub cgroup: Option<CgroupHandle>,
    pub worker: Option<WorkerHandle>,
    /// Status sender while the job is still launching; the worker takes it over after.
    pub launching: Option<watch::Sender<JobStatus>>,
    /// Stop requested before the worker existed. `true` means forced.
    pub pending_stop: Option<bool>,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Remember a stop for a job that has no worker yet. A forced stop wins.
    pub fn request_stop(&mut self, force: bool) {
        if self.launching.is_some() {
            self.pending_stop = Some(force || self.pending_stop.unwrap_or(false));
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.job_id,
            owner: self.owner.clone(),
            program: self.program.clone(),
            args: self.args.clone(),
            created_at: self.created_at,
            pid: self.pid,
            status: self.status(),
        }
    }
}
