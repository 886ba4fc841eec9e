mod actor;
mod messages;

use crate::broadcaster::Broadcaster;
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::events::JobStatus;
use crate::isolation::SpawnedJob;
use crate::types::JobId;
use actor::Actor;
use messages::WorkerMessage;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Everything a job's supervisor takes ownership of once the job is running.
pub struct Supervised {
    pub job_id: JobId,
    pub job: SpawnedJob,
    pub cgroup: CgroupHandle,
    pub cgroups: CgroupManager,
    pub output: Broadcaster,
    pub status: watch::Sender<JobStatus>,
    pub stop_grace_period: Duration,
}

/// Handle to the task supervising one running job.
///
/// The supervisor is the only writer of the job's status once it is running: it waits for
/// the process to exit, finishes collecting output, removes the cgroup and then publishes the
/// terminal status.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn spawn(supervised: Supervised) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, supervised);
        Self { sender }
    }

    /// Ask the supervisor to terminate the job. A job that already exited ignores this.
    pub fn stop(&self, force: bool) {
        let _ = self.sender.send(WorkerMessage::Stop { force });
    }
}
