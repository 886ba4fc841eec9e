use super::messages::WorkerMessage;
use super::Supervised;
use crate::broadcaster::Broadcaster;
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::error::Error;
use crate::events::JobStatus;
use crate::isolation::reaper;
use crate::types::{JobId, OutputSource};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::{
    io,
    process::Child,
    select,
    sync::{mpsc, watch},
    time::{sleep_until, timeout, Instant},
};

/// How long output may keep trickling in after the job process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    job_id: JobId,
    pid: Pid,
    cgroup: CgroupHandle,
    cgroups: CgroupManager,
    output: Broadcaster,
    status: watch::Sender<JobStatus>,
    stop_grace_period: Duration,
    kill_deadline: Option<Instant>,
}

impl Actor {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<WorkerMessage>, supervised: Supervised) {
        let Supervised {
            job_id,
            job,
            cgroup,
            cgroups,
            output,
            status,
            stop_grace_period,
        } = supervised;
        let actor = Self {
            inbox,
            job_id,
            pid: Pid::from_raw(job.pid as i32),
            cgroup,
            cgroups,
            output,
            status,
            stop_grace_period,
            kill_deadline: None,
        };
        tokio::spawn(async move {
            actor.run(job.child, job.stdout, job.stderr).await;
        });
    }

    async fn run<O, E>(mut self, mut child: Child, stdout: O, stderr: E)
    where
        O: io::AsyncRead + Unpin + Send + 'static,
        E: io::AsyncRead + Unpin + Send + 'static,
    {
        // pipe stdout and stderr into the broadcaster
        let mut stdout_task = {
            let output = self.output.clone();
            tokio::spawn(async move { output.capture(stdout, OutputSource::Stdout).await })
        };
        let mut stderr_task = {
            let output = self.output.clone();
            tokio::spawn(async move { output.capture(stderr, OutputSource::Stderr).await })
        };

        let exit_status = loop {
            select! {
                exit_status = child.wait() => break exit_status,
                Some(msg) = self.inbox.recv() => match msg {
                    WorkerMessage::Stop { force } => self.terminate(force),
                },
                _ = sleep_until(self.kill_deadline.unwrap_or_else(Instant::now)), if self.kill_deadline.is_some() => {
                    self.kill_deadline = None;
                    tracing::warn!(job_id = %self.job_id, "job ignored SIGTERM, sending SIGKILL");
                    self.signal_job(Signal::SIGKILL);
                }
            }
        };
        let status = match exit_status {
            Ok(exit_status) => final_status(exit_status),
            Err(err) => {
                tracing::error!(job_id = %self.job_id, error = %err, "lost track of job process");
                JobStatus::Exited { code: -1 }
            }
        };

        let drained = timeout(
            OUTPUT_DRAIN_TIMEOUT,
            futures::future::join(&mut stdout_task, &mut stderr_task),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(job_id = %self.job_id, "job output still open after exit, closing stream");
            stdout_task.abort();
            stderr_task.abort();
        }
        self.output.close();
        if let Err(err) = self.cgroups.remove_when_empty(&self.cgroup).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "failed to remove cgroup");
        }

        tracing::info!(job_id = %self.job_id, %status, "job finished");
        self.status.send_replace(status);
    }

    fn terminate(&mut self, force: bool) {
        if force {
            tracing::info!(job_id = %self.job_id, "killing job");
            self.kill_deadline = None;
            self.signal_job(Signal::SIGKILL);
        } else {
            tracing::info!(job_id = %self.job_id, "terminating job");
            self.signal_job(Signal::SIGTERM);
            if self.kill_deadline.is_none() {
                self.kill_deadline = Some(Instant::now() + self.stop_grace_period);
            }
        }
    }

    /// Signal the job's process group, then anything descended from it that escaped the group.
    fn signal_job(&self, signal: Signal) {
        match killpg(self.pid, signal) {
            // already gone, which is what the caller wanted
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %Error::SignalFailed(err), "stop failed")
            }
        }
        let reaped = reaper::signal_descendants(self.pid.as_raw(), signal);
        tracing::debug!(job_id = %self.job_id, reaped, %signal, "signalled job descendants");
    }
}

fn final_status(exit_status: ExitStatus) -> JobStatus {
    if let Some(code) = exit_status.code() {
        JobStatus::Exited { code }
    } else if let Some(signal) = exit_status.signal() {
        JobStatus::Killed { signal }
    } else {
        JobStatus::Exited { code: -1 }
    }
}
