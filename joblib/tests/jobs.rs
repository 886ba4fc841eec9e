//! End-to-end job tests. These need permission to create namespaces; where the kernel
//! refuses, starting a job fails with `SpawnFailed` and the test returns early.

use joblib::authz::PolicyTable;
use joblib::config::{JobConfig, ResourceLimits};
use joblib::error::Error;
use joblib::isolation::reaper;
use joblib::types::{JobId, OutputSource};
use joblib::{JobCoordinator, JobStatus};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

struct Harness {
    coordinator: JobCoordinator,
    group: PathBuf,
    _scratch: TempDir,
}

impl Harness {
    fn new() -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let config = JobConfig {
            cgroup_root: scratch.path().to_path_buf(),
            ..test_config()
        };
        Self::with_config(config, scratch)
    }

    fn with_config(config: JobConfig, scratch: TempDir) -> Self {
        let group = config.cgroup_root.join(&config.cgroup_group);
        let policy: PolicyTable = [("tester", vec!["/"])].into_iter().collect();
        let coordinator = JobCoordinator::spawn(config, policy).unwrap();
        Self {
            coordinator,
            group,
            _scratch: scratch,
        }
    }

    /// Start a job, or `None` if this environment cannot create namespaces.
    async fn start(&self, cmd: &str, args: &[&str]) -> Option<JobId> {
        let args = args.iter().map(|s| s.to_string()).collect();
        match self.coordinator.start_job("tester", cmd, args).await {
            Ok(job_id) => Some(job_id),
            Err(Error::SpawnFailed(reason)) => {
                eprintln!("skipping, cannot isolate jobs here: {}", reason);
                None
            }
            Err(err) => panic!("unexpected start failure: {}", err),
        }
    }

    async fn output(&self, job_id: JobId) -> Vec<(OutputSource, String)> {
        let mut reader = self.coordinator.stream_output(job_id).await.unwrap();
        let mut records = vec![];
        while let Some(record) = timeout(TEST_TIMEOUT, reader.next()).await.unwrap() {
            records.push((record.source, record.text.clone()));
        }
        records
    }

    fn cgroup_path(&self, job_id: JobId) -> PathBuf {
        self.group.join(job_id.to_string())
    }
}

fn test_config() -> JobConfig {
    JobConfig {
        init_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_jobinit"))),
        stop_grace_period_ms: 500,
        ..JobConfig::default()
    }
}

/// The unified cgroup mount, if this process may create cgroups under it.
fn writable_cgroup2() -> Option<PathBuf> {
    let root = PathBuf::from("/sys/fs/cgroup");
    if !root.join("cgroup.controllers").exists() {
        return None;
    }
    let check = root.join(format!("joblib-check-{}", JobId::new()));
    fs::create_dir(&check).ok()?;
    let _ = fs::remove_dir(&check);
    Some(root)
}

/// The cgroup v2 path `pid` belongs to, relative to the mount.
fn cgroup_of(pid: i32) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/cgroup", pid))
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("0::").map(str::to_string))
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path).unwrap().trim().to_string()
}

#[tokio::test]
async fn echo_streams_one_record_then_ends() {
    let harness = Harness::new();
    let job_id = match harness.start("echo", &["hello", "world"]).await {
        Some(job_id) => job_id,
        None => return,
    };

    let records = harness.output(job_id).await;
    assert_eq!(
        records,
        vec![(OutputSource::Stdout, "hello world".to_string())]
    );

    // end of stream is only reached after exit, and the final status lands right after
    let status = timeout(TEST_TIMEOUT, harness.coordinator.wait_job(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Exited { code: 0 });
    assert_eq!(
        harness.coordinator.get_job_status(job_id).await.unwrap(),
        JobStatus::Exited { code: 0 }
    );
}

#[tokio::test]
async fn stopping_a_finished_job_reports_its_exit() {
    let harness = Harness::new();
    let job_id = match harness.start("sh", &["-c", "exit 3"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let first = harness.coordinator.stop_job(job_id, false).await.unwrap();
    let second = harness.coordinator.stop_job(job_id, true).await.unwrap();
    assert_eq!(first, second);
    assert!(first.is_terminal());
}

#[tokio::test]
async fn exit_codes_are_preserved() {
    let harness = Harness::new();
    let job_id = match harness.start("sh", &["-c", "echo oops >&2; exit 3"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let records = harness.output(job_id).await;
    assert_eq!(records, vec![(OutputSource::Stderr, "oops".to_string())]);
    let status = harness.coordinator.wait_job(job_id).await.unwrap();
    assert_eq!(status, JobStatus::Exited { code: 3 });
}

#[tokio::test]
async fn graceful_stop_terminates_a_sleeping_job() {
    let harness = Harness::new();
    let job_id = match harness.start("sleep", &["60"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    assert_eq!(
        harness.coordinator.get_job_status(job_id).await.unwrap(),
        JobStatus::Running
    );

    let status = timeout(TEST_TIMEOUT, harness.coordinator.stop_job(job_id, false))
        .await
        .expect("stop never completed")
        .unwrap();
    // sleep has no TERM handler and is not the namespace's PID 1, so SIGTERM ends it
    assert_eq!(status, JobStatus::Killed { signal: 15 });
    assert_eq!(
        harness.coordinator.get_job_status(job_id).await.unwrap(),
        status
    );
}

#[tokio::test]
async fn graceful_stop_escalates_when_term_is_ignored() {
    let harness = Harness::new();
    let job_id = match harness
        .start("sh", &["-c", "trap '' TERM; while :; do sleep 1; done"])
        .await
    {
        Some(job_id) => job_id,
        None => return,
    };
    let status = timeout(TEST_TIMEOUT, harness.coordinator.stop_job(job_id, false))
        .await
        .expect("stop never completed")
        .unwrap();
    assert_eq!(status, JobStatus::Killed { signal: 9 });
}

#[tokio::test]
async fn forced_stop_kills_with_sigkill() {
    let harness = Harness::new();
    let job_id = match harness.start("sleep", &["60"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let status = timeout(TEST_TIMEOUT, harness.coordinator.stop_job(job_id, true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Killed { signal: 9 });
}

#[tokio::test]
async fn subscribers_see_the_same_records() {
    let harness = Harness::new();
    let job_id = match harness
        .start("sh", &["-c", "for i in 1 2 3 4 5; do echo line $i; sleep 0.05; done"])
        .await
    {
        Some(job_id) => job_id,
        None => return,
    };

    let early = harness.output(job_id);
    let delayed = async {
        tokio::time::sleep(Duration::from_millis(120)).await;
        harness.output(job_id).await
    };
    let (early, delayed) = tokio::join!(early, delayed);
    let late = harness.output(job_id).await;

    let expected: Vec<_> = (1..=5)
        .map(|i| (OutputSource::Stdout, format!("line {}", i)))
        .collect();
    assert_eq!(early, expected);
    assert_eq!(delayed, expected);
    assert_eq!(late, expected);
}

#[tokio::test]
async fn job_runs_under_its_own_namespace_init() {
    let harness = Harness::new();
    let job_id = match harness.start("sh", &["-c", "echo $PPID"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let records = harness.output(job_id).await;
    assert_eq!(records, vec![(OutputSource::Stdout, "1".to_string())]);
}

#[tokio::test]
async fn job_info_describes_the_job() {
    let harness = Harness::new();
    let job_id = match harness.start("true", &[]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let info = harness.coordinator.job_info(job_id).await.unwrap();
    assert_eq!(info.job_id, job_id);
    assert_eq!(info.owner, "tester");
    assert!(info.program.is_absolute());
    assert!(info.program.ends_with("true"));
    assert!(info.pid.is_some());
}

#[tokio::test]
async fn cgroup_is_gone_once_the_job_is_terminal() {
    let harness = Harness::new();
    let job_id = match harness.start("sleep", &["60"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    assert!(harness.cgroup_path(job_id).is_dir());

    harness.coordinator.stop_job(job_id, true).await.unwrap();
    assert!(!harness.cgroup_path(job_id).exists());
}

#[tokio::test]
async fn failed_exec_is_a_spawn_failure() {
    let harness = Harness::new();
    let err = harness
        .coordinator
        .start_job("tester", "/nonexistent/program", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpawnFailed(_)));
}

#[tokio::test]
async fn shutdown_stops_running_jobs() {
    let harness = Harness::new();
    let job_id = match harness.start("sleep", &["60"]).await {
        Some(job_id) => job_id,
        None => return,
    };
    let mut reader = harness.coordinator.stream_output(job_id).await.unwrap();

    timeout(TEST_TIMEOUT, harness.coordinator.shutdown())
        .await
        .unwrap()
        .unwrap();

    // readers hold on to the log, which is closed now
    assert!(reader.next().await.is_none());
    assert!(!harness.cgroup_path(job_id).exists());
    assert!(matches!(
        harness.coordinator.start_job("tester", "true", vec![]).await,
        Err(Error::Shutdown)
    ));
}

#[tokio::test]
async fn job_processes_live_in_the_limited_cgroup() {
    let root = match writable_cgroup2() {
        Some(root) => root,
        None => {
            eprintln!("skipping, no writable cgroup2 mount");
            return;
        }
    };
    let group = format!("joblib-test-{}", JobId::new());
    let limits = ResourceLimits {
        cpu_quota_us: 50_000,
        cpu_period_us: 100_000,
        memory_max_bytes: 64 * 1024 * 1024,
        ..ResourceLimits::default()
    };
    let config = JobConfig {
        cgroup_root: root,
        cgroup_group: group.clone(),
        limits,
        ..test_config()
    };
    let harness = Harness::with_config(config, tempfile::tempdir().unwrap());
    let job_id = match harness.start("sleep", &["60"]).await {
        Some(job_id) => job_id,
        None => return,
    };

    let pid = harness.coordinator.job_info(job_id).await.unwrap().pid.unwrap() as i32;
    let mut pids = vec![pid];
    pids.extend(reaper::descendants_of(pid));
    // host side init, namespace init and the command itself
    assert!(pids.len() >= 3, "job processes: {:?}", pids);
    let expected = format!("/{}/{}", group, job_id);
    for pid in &pids {
        let cgroup = cgroup_of(*pid).unwrap_or_default();
        assert!(cgroup.ends_with(&expected), "pid {} is in {:?}", pid, cgroup);
    }

    let enabled = fs::read_to_string(harness.group.join("cgroup.subtree_control")).unwrap();
    let enabled: Vec<_> = enabled.split_whitespace().collect();
    let job_cgroup = harness.cgroup_path(job_id);
    if enabled.contains(&"cpu") {
        assert_eq!(read_trimmed(&job_cgroup.join("cpu.max")), "50000 100000");
    }
    if enabled.contains(&"memory") {
        assert_eq!(read_trimmed(&job_cgroup.join("memory.max")), "67108864");
    }

    harness.coordinator.stop_job(job_id, true).await.unwrap();
    assert!(!job_cgroup.exists());
    harness.coordinator.shutdown().await.unwrap();
    assert!(!harness.group.exists());
}

/// An init program that waits until the returned fifo is written before it starts the job.
fn gated_init(scratch: &TempDir) -> (PathBuf, PathBuf) {
    let gate = scratch.path().join("gate");
    mkfifo(&gate, Mode::S_IRWXU).unwrap();
    let init = scratch.path().join("gated-init");
    // read and exec are builtins, so the shell never forks inside the new PID namespace
    fs::write(
        &init,
        format!(
            "#!/bin/sh\nread open < {}\nexec {} \"$@\"\n",
            gate.display(),
            env!("CARGO_BIN_EXE_jobinit")
        ),
    )
    .unwrap();
    fs::set_permissions(&init, fs::Permissions::from_mode(0o755)).unwrap();
    (init, gate)
}

fn gated_harness() -> (Harness, PathBuf) {
    let scratch = tempfile::tempdir().unwrap();
    let (init, gate) = gated_init(&scratch);
    let config = JobConfig {
        cgroup_root: scratch.path().to_path_buf(),
        init_program: Some(init),
        ..test_config()
    };
    (Harness::with_config(config, scratch), gate)
}

async fn open_gate(gate: PathBuf) {
    tokio::task::spawn_blocking(move || fs::write(gate, "go\n"))
        .await
        .unwrap()
        .unwrap();
}

/// Whether this host lets us create namespaces at all.
async fn can_isolate() -> bool {
    let harness = Harness::new();
    harness.start("true", &[]).await.is_some()
}

#[tokio::test]
async fn lookups_do_not_wait_for_a_launching_job() {
    if !can_isolate().await {
        return;
    }
    let (harness, gate) = gated_harness();
    let coordinator = harness.coordinator.clone();
    let starting = tokio::spawn(async move { coordinator.start_job("tester", "true", vec![]).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let began = Instant::now();
    let status = harness.coordinator.get_job_status(JobId::new()).await;
    assert!(matches!(status, Err(Error::NotFound)));
    assert!(began.elapsed() < Duration::from_millis(500));
    assert!(!starting.is_finished());

    open_gate(gate).await;
    let job_id = timeout(TEST_TIMEOUT, starting).await.unwrap().unwrap().unwrap();
    let status = timeout(TEST_TIMEOUT, harness.coordinator.wait_job(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Exited { code: 0 });
}

#[tokio::test]
async fn shutdown_during_launch_kills_the_job_once_running() {
    if !can_isolate().await {
        return;
    }
    let (harness, gate) = gated_harness();
    let group = harness.group.clone();
    let coordinator = harness.coordinator.clone();
    let starting =
        tokio::spawn(async move { coordinator.start_job("tester", "sleep", vec!["60".into()]).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let coordinator = harness.coordinator.clone();
    let shutting_down = tokio::spawn(async move { coordinator.shutdown().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!shutting_down.is_finished());

    open_gate(gate).await;
    let started = timeout(TEST_TIMEOUT, starting).await.unwrap().unwrap();
    assert!(started.is_ok(), "{:?}", started.err());
    // well inside the sleep, so the job was killed rather than waited out
    timeout(TEST_TIMEOUT, shutting_down)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!group.exists());
}
