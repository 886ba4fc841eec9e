use super::messages::CoordinatorMessage;
use super::record::JobRecord;
use crate::actors::worker::{Supervised, WorkerHandle};
use crate::authz::{self, PolicyTable};
use crate::broadcaster::{Broadcaster, OutputReader};
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::config::{JobConfig, ResourceLimits};
use crate::error::{self, Error};
use crate::events::JobStatus;
use crate::isolation::{Launcher, RunAs, SpawnedJob};
use crate::types::{Args, JobId, JobInfo, Principal, Program};

use chrono::Utc;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

pub struct JobCoordinator {
    inbox: mpsc::Receiver<CoordinatorMessage>,
    records: HashMap<JobId, JobRecord>,
    config: JobConfig,
    policy: PolicyTable,
    launcher: Launcher,
    cgroups: CgroupManager,
    run_as: Option<RunAs>,
    /// Launches in flight. They run off the actor so lookups never wait on a spawn.
    starting: JoinSet<Launched>,
    shutting_down: bool,
}

/// What a launch task hands back to the actor.
struct Launched {
    job_id: JobId,
    response: oneshot::Sender<error::Result<JobId>>,
    result: error::Result<(SpawnedJob, CgroupHandle)>,
}

impl JobCoordinator {
    pub fn spawn(
        inbox: mpsc::Receiver<CoordinatorMessage>,
        config: JobConfig,
        policy: PolicyTable,
        run_as: Option<RunAs>,
    ) {
        let cgroups = CgroupManager::new(&config.cgroup_root, &config.cgroup_group);
        if let Err(err) = cgroups.prepare() {
            // every start will fail with the same error, but status/stream keep working
            tracing::warn!(error = %err, "cgroup group directory unavailable");
        }
        let actor = Self {
            inbox,
            records: HashMap::new(),
            launcher: Launcher::new(config.init_program.clone()),
            cgroups,
            config,
            policy,
            run_as,
            starting: JoinSet::new(),
            shutting_down: false,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        loop {
            select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => {
                        if !self.handle(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(joined) = self.starting.join_next(), if !self.starting.is_empty() => match joined {
                    Ok(launched) => self.finish_start(launched),
                    Err(err) => tracing::error!(error = %err, "job launch task failed"),
                },
            }
        }
    }

    /// Returns false once the coordinator should stop.
    fn handle(&mut self, msg: CoordinatorMessage) -> bool {
        use self::CoordinatorMessage::*;
        match msg {
            StartJob {
                caller,
                cmd,
                args,
                response,
            } => self.start_job(caller, cmd, args, response),
            StopJob {
                job_id,
                force,
                response,
            } => {
                let _ = response.send(self.stop_job(job_id, force));
            }
            GetStatus { job_id, response } => {
                let _ = response.send(self.get_job_status(job_id));
            }
            WatchStatus { job_id, response } => {
                let _ = response.send(self.watch_status(job_id));
            }
            GetInfo { job_id, response } => {
                let _ = response.send(self.get_job_info(job_id));
            }
            StreamOutput { job_id, response } => {
                let _ = response.send(self.stream_output(job_id));
            }
            Shutdown { response } => {
                let _ = response.send(self.shutdown());
            }
            Discard { response } => {
                self.discard();
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    /// Authorize and register the job, then launch it in the background. The caller is
    /// answered from `finish_start`.
    fn start_job(
        &mut self,
        caller: Principal,
        cmd: Program,
        args: Args,
        response: oneshot::Sender<error::Result<JobId>>,
    ) {
        if self.shutting_down {
            let _ = response.send(Err(Error::Shutdown));
            return;
        }
        let program = resolve_program(&cmd).unwrap_or_else(|| PathBuf::from(&cmd));
        if !authz::is_allowed(&caller, &program, &self.policy) {
            tracing::warn!(principal = %caller, program = %program.display(), "job start denied");
            let _ = response.send(Err(Error::AuthorizationDenied {
                principal: caller,
                program,
            }));
            return;
        }

        let job_id = JobId::new();
        let (status_tx, status_rx) = watch::channel(JobStatus::Starting);
        self.records.insert(
            job_id,
            JobRecord {
                job_id,
                owner: caller,
                program: program.clone(),
                args: args.clone(),
                created_at: Utc::now(),
                pid: None,
                status: status_rx,
                output: Broadcaster::new(),
                cgroup: None,
                worker: None,
                launching: Some(status_tx),
                pending_stop: None,
            },
        );

        let launcher = self.launcher.clone();
        let cgroups = self.cgroups.clone();
        let limits = self.config.limits.clone();
        let run_as = self.run_as;
        self.starting.spawn(async move {
            let result = launch(&launcher, &cgroups, &limits, run_as, job_id, &program, &args).await;
            Launched {
                job_id,
                response,
                result,
            }
        });
    }

    fn finish_start(&mut self, launched: Launched) {
        let Launched {
            job_id,
            response,
            result,
        } = launched;
        let record = match self.records.get_mut(&job_id) {
            Some(record) => record,
            None => {
                let _ = response.send(Err(Error::NotFound));
                return;
            }
        };
        let status_tx = match record.launching.take() {
            Some(status_tx) => status_tx,
            None => {
                tracing::error!(%job_id, "job launched twice");
                return;
            }
        };

        let (job, cgroup) = match result {
            Ok(launched) => launched,
            Err(err) => {
                tracing::warn!(%job_id, error = %err, "job failed to start");
                status_tx.send_replace(JobStatus::StartFailed {
                    reason: err.to_string(),
                });
                record.output.close();
                let _ = response.send(Err(err));
                return;
            }
        };

        let pid = job.pid;
        status_tx.send_replace(JobStatus::Running);
        let worker = WorkerHandle::spawn(Supervised {
            job_id,
            job,
            cgroup: cgroup.clone(),
            cgroups: self.cgroups.clone(),
            output: record.output.clone(),
            status: status_tx,
            stop_grace_period: self.config.stop_grace_period(),
        });
        // a stop that arrived while the job was launching
        let pending_stop = if self.shutting_down {
            Some(true)
        } else {
            record.pending_stop.take()
        };
        if let Some(force) = pending_stop {
            worker.stop(force);
        }
        record.pid = Some(pid);
        record.cgroup = Some(cgroup);
        record.worker = Some(worker);

        tracing::info!(%job_id, principal = %record.owner, program = %record.program.display(), pid, "job started");
        let _ = response.send(Ok(job_id));
    }

    fn stop_job(
        &mut self,
        job_id: JobId,
        force: bool,
    ) -> error::Result<watch::Receiver<JobStatus>> {
        let record = self.records.get_mut(&job_id).ok_or(Error::NotFound)?;
        if !record.status().is_terminal() {
            match &record.worker {
                Some(worker) => worker.stop(force),
                None => record.request_stop(force),
            }
        }
        Ok(record.status.clone())
    }

    fn get_job_status(&self, job_id: JobId) -> error::Result<JobStatus> {
        self.records
            .get(&job_id)
            .map(JobRecord::status)
            .ok_or(Error::NotFound)
    }

    fn watch_status(&self, job_id: JobId) -> error::Result<watch::Receiver<JobStatus>> {
        self.records
            .get(&job_id)
            .map(|record| record.status.clone())
            .ok_or(Error::NotFound)
    }

    fn get_job_info(&self, job_id: JobId) -> error::Result<JobInfo> {
        self.records
            .get(&job_id)
            .map(JobRecord::info)
            .ok_or(Error::NotFound)
    }

    fn stream_output(&self, job_id: JobId) -> error::Result<OutputReader> {
        self.records
            .get(&job_id)
            .map(|record| record.output.subscribe())
            .ok_or(Error::NotFound)
    }

    fn shutdown(&mut self) -> Vec<watch::Receiver<JobStatus>> {
        self.shutting_down = true;
        self.records
            .values_mut()
            .map(|record| {
                match &record.worker {
                    Some(worker) => worker.stop(true),
                    None => record.request_stop(true),
                }
                record.status.clone()
            })
            .collect()
    }

    fn discard(&mut self) {
        for record in self.records.values() {
            if let Some(cgroup) = &record.cgroup {
                if let Err(err) = self.cgroups.remove(cgroup) {
                    tracing::warn!(job_id = %record.job_id, error = %err, "failed to remove cgroup");
                }
            }
        }
        tracing::info!(jobs = self.records.len(), "discarding job records");
        self.records.clear();
        if let Err(err) = self.cgroups.teardown() {
            tracing::warn!(error = %err, "failed to remove cgroup group directory");
        }
    }
}

/// Spawn the init stage, put it in the job's cgroup, then let it start the command. Anything
/// the init stage forks after the release is born inside the cgroup.
async fn launch(
    launcher: &Launcher,
    cgroups: &CgroupManager,
    limits: &ResourceLimits,
    run_as: Option<RunAs>,
    job_id: JobId,
    program: &Path,
    args: &[String],
) -> error::Result<(SpawnedJob, CgroupHandle)> {
    let pending = launcher.spawn(program, args, run_as)?;
    let cgroup = match cgroups.create(&job_id, limits) {
        Ok(cgroup) => cgroup,
        Err(err) => {
            pending.abandon();
            return Err(err);
        }
    };
    if let Err(err) = cgroups.add_process(&cgroup, pending.pid) {
        tracing::warn!(%job_id, error = %err, "job runs outside its cgroup");
    }
    match pending.release().await {
        Ok(job) => Ok((job, cgroup)),
        Err(err) => {
            if let Err(err) = cgroups.remove_when_empty(&cgroup).await {
                tracing::warn!(%job_id, error = %err, "failed to remove cgroup");
            }
            Err(err)
        }
    }
}

/// Resolve a bare command name against `PATH`. Symlinks are left alone so multi-call
/// binaries still see the name they were invoked by.
fn resolve_program(cmd: &str) -> Option<PathBuf> {
    if cmd.contains('/') {
        return Some(PathBuf::from(cmd));
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(cmd))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
