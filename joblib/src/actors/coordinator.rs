mod actor;
mod messages;
mod record;

use self::{
    actor::JobCoordinator,
    messages::CoordinatorMessage::{
        self, Discard, GetInfo, GetStatus, Shutdown, StartJob, StopJob, StreamOutput,
        WatchStatus,
    },
};
use crate::authz::PolicyTable;
use crate::broadcaster::OutputReader;
use crate::config::JobConfig;
use crate::error::{self, Error};
use crate::events::JobStatus;
use crate::isolation::RunAs;
use crate::types::{Args, JobId, JobInfo, Principal, Program};
use tokio::sync::{mpsc, oneshot, watch};

const MESSAGE_CAPACITY: usize = 64;

/// A `JobCoordinator` which provides functionality for managing jobs and querying job state.
///
/// This struct is actually an actor handle, the real work is done in the actor spawned by `JobCoordinator::spawn`,
/// but from the user perspective all that matters is that this struct provides methods for managing jobs.
/// The actor-handle abstraction allows this struct to be cloned freely in a multi-thread async context,
/// without requiring an `Arc<Mutex>` or any other means of synchronization.
///
/// The actor owns the job table, so inserts and lookups are serialized through its inbox. Each running
/// job additionally has its own supervising worker, which is the only writer of that job's status.
#[derive(Clone)]
pub struct JobCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
}

impl JobCoordinatorHandle {
    /// Spawn a new coordinator. Must be called from within a tokio runtime.
    pub fn spawn(config: JobConfig, policy: PolicyTable) -> error::Result<Self> {
        let run_as = config.run_as.as_deref().map(RunAs::from_name).transpose()?;
        let (sender, receiver) = mpsc::channel(MESSAGE_CAPACITY);
        JobCoordinator::spawn(receiver, config, policy, run_as);
        Ok(Self { sender })
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMessage,
    ) -> error::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(msg(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Start a new job on behalf of `caller`.
    ///
    /// Returns once the command is running and registered, not once it finishes.
    pub async fn start_job(
        &self,
        caller: impl Into<Principal>,
        cmd: impl Into<Program>,
        args: Args,
    ) -> error::Result<JobId> {
        let caller = caller.into();
        let cmd = cmd.into();
        self.request(|response| StartJob {
            caller,
            cmd,
            args,
            response,
        })
        .await?
    }

    /// Stop a job and wait for it to exit. Stopping a finished job returns its final status.
    pub async fn stop_job(&self, job_id: JobId, force: bool) -> error::Result<JobStatus> {
        let status = self
            .request(|response| StopJob {
                job_id,
                force,
                response,
            })
            .await??;
        wait_for_exit(status).await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> error::Result<JobStatus> {
        self.request(|response| GetStatus { job_id, response })
            .await?
    }

    /// Wait until the job reaches a terminal state, without signalling it.
    pub async fn wait_job(&self, job_id: JobId) -> error::Result<JobStatus> {
        let status = self
            .request(|response| WatchStatus { job_id, response })
            .await??;
        wait_for_exit(status).await
    }

    pub async fn job_info(&self, job_id: JobId) -> error::Result<JobInfo> {
        self.request(|response| GetInfo { job_id, response }).await?
    }

    /// Subscribe to a job's combined output, replayed from the first record.
    pub async fn stream_output(&self, job_id: JobId) -> error::Result<OutputReader> {
        self.request(|response| StreamOutput { job_id, response })
            .await?
    }

    /// Kill every job, wait for their supervisors, then drop all records and cgroups.
    ///
    /// Every call after this fails with `Error::Shutdown`.
    pub async fn shutdown(&self) -> error::Result<()> {
        let statuses = self.request(|response| Shutdown { response }).await?;
        for result in futures::future::join_all(statuses.into_iter().map(wait_for_exit)).await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "job supervisor vanished during shutdown");
            }
        }
        self.request(|response| Discard { response }).await
    }
}

async fn wait_for_exit(mut status: watch::Receiver<JobStatus>) -> error::Result<JobStatus> {
    let status = status
        .wait_for(JobStatus::is_terminal)
        .await
        .map_err(|_| Error::Shutdown)?;
    Ok(status.clone())
}
