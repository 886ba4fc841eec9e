use crate::broadcaster::OutputReader;
use crate::error;
use crate::events::JobStatus;
use crate::types::{Args, JobId, JobInfo, Principal, Program};
use tokio::sync::{oneshot, watch};

pub enum CoordinatorMessage {
    StartJob {
        caller: Principal,
        cmd: Program,
        args: Args,
        response: oneshot::Sender<error::Result<JobId>>,
    },
    StopJob {
        job_id: JobId,
        force: bool,
        response: oneshot::Sender<error::Result<watch::Receiver<JobStatus>>>,
    },
    GetStatus {
        job_id: JobId,
        response: oneshot::Sender<error::Result<JobStatus>>,
    },
    WatchStatus {
        job_id: JobId,
        response: oneshot::Sender<error::Result<watch::Receiver<JobStatus>>>,
    },
    GetInfo {
        job_id: JobId,
        response: oneshot::Sender<error::Result<JobInfo>>,
    },
    StreamOutput {
        job_id: JobId,
        response: oneshot::Sender<error::Result<OutputReader>>,
    },
    /// Kill every live job and hand back their status channels.
    Shutdown {
        response: oneshot::Sender<Vec<watch::Receiver<JobStatus>>>,
    },
    /// Drop all records and cgroups, then stop the coordinator.
    Discard { response: oneshot::Sender<()> },
}
