pub mod init;
pub mod reaper;

use crate::error::{Error, Result};
use init::{InitRequest, INIT_MARKER};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{self, setpgid, Gid, Pid, Uid, User};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{self, Child, ChildStderr, ChildStdout};

/// Credentials the job command runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunAs {
    pub uid: Uid,
    pub gid: Gid,
}

impl RunAs {
    /// Look up a user by name.
    pub fn from_name(name: &str) -> Result<Self> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(Self {
                uid: user.uid,
                gid: user.gid,
            }),
            Ok(None) => Err(Error::SpawnFailed(format!("unknown run-as user {:?}", name))),
            Err(err) => Err(Error::SpawnFailed(format!(
                "looking up run-as user {:?}: {}",
                name, err
            ))),
        }
    }
}

/// A job process that made it all the way to exec'ing its command.
pub struct SpawnedJob {
    /// Host-visible pid of the init stage, which is also the process group id.
    pub pid: u32,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// An init stage that is running but held back from starting the command.
///
/// Whatever the init stage forks after `release` inherits its cgroup, so the caller moves
/// `pid` into the job's cgroup first.
pub struct PendingJob {
    pub pid: u32,
    child: Child,
    go: File,
    report: File,
}

impl PendingJob {
    /// Let the init stage start the command, and wait until the command is exec'd.
    pub async fn release(self) -> Result<SpawnedJob> {
        let Self {
            pid,
            mut child,
            mut go,
            report,
        } = self;
        let setup_error = tokio::task::spawn_blocking(move || {
            if let Err(err) = go.write_all(&[GO]) {
                return Some(format!("releasing init stage: {}", err));
            }
            drop(go);
            read_report(report)
        })
        .await
        .map_err(|err| Error::SpawnFailed(format!("waiting for init stage: {}", err)))?;
        if let Some(reason) = setup_error {
            kill_group(pid);
            let _ = child.wait().await;
            return Err(Error::SpawnFailed(reason));
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => Ok(SpawnedJob {
                pid,
                child,
                stdout,
                stderr,
            }),
            _ => Err(Error::SpawnFailed("job output is not piped".into())),
        }
    }

    /// Kill an init stage that will never be released, and reap it in the background.
    pub fn abandon(self) {
        // closing the go pipe already makes the init stage give up
        drop(self.go);
        kill_group(self.pid);
        let mut child = self.child;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
}

const GO: u8 = 1;

/// Starts job commands inside fresh mount, network and PID namespaces.
///
/// The launcher re-executes `init_program` with `INIT_MARKER` as its first argument. The
/// namespaces are unshared between fork and exec, the init stage (see [`init`]) does the rest
/// and execs the command once released. Setup errors travel back over a close-on-exec pipe,
/// so `PendingJob::release` returns only once the command itself is running.
#[derive(Clone, Debug)]
pub struct Launcher {
    init_program: Option<PathBuf>,
}

impl Launcher {
    pub fn new(init_program: Option<PathBuf>) -> Self {
        Self { init_program }
    }

    fn init_program(&self) -> Result<PathBuf> {
        match &self.init_program {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|err| Error::SpawnFailed(format!("locating own executable: {}", err))),
        }
    }

    pub fn spawn(
        &self,
        program: &Path,
        args: &[String],
        run_as: Option<RunAs>,
    ) -> Result<PendingJob> {
        let init_program = self.init_program()?;
        let (report_rx, report_tx) = pipe("report")?;
        let (go_rx, go_tx) = match pipe("go") {
            Ok(fds) => fds,
            Err(err) => {
                let _ = unistd::close(report_tx);
                return Err(err);
            }
        };
        // SAFETY: pipe2 just handed us sole ownership of these ends.
        let report = unsafe { File::from_raw_fd(report_rx) };
        let go = unsafe { File::from_raw_fd(go_tx) };

        let request = InitRequest {
            report_fd: report_tx,
            go_fd: go_rx,
            credentials: run_as.map(|r| (r.uid.as_raw(), r.gid.as_raw())),
            program: program.to_string_lossy().into_owned(),
            args: args.to_vec(),
        };
        let mut command = process::Command::new(&init_program);
        command
            .arg(INIT_MARKER)
            .args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: only async-signal-safe syscalls run between fork and exec.
        unsafe {
            command.pre_exec(move || enter_namespaces(report_tx, go_rx));
        }
        let spawned = command.spawn();
        // drop our copies of the init stage's ends so EOF means it is done with them
        let _ = unistd::close(report_tx);
        let _ = unistd::close(go_rx);
        let child =
            spawned.map_err(|err| Error::SpawnFailed(format!("{}: {}", init_program.display(), err)))?;

        match child.id() {
            Some(pid) => Ok(PendingJob {
                pid,
                child,
                go,
                report,
            }),
            None => Err(Error::SpawnFailed("init stage exited before it was registered".into())),
        }
    }
}

fn pipe(name: &str) -> Result<(RawFd, RawFd)> {
    unistd::pipe2(OFlag::O_CLOEXEC).map_err(|err| Error::SpawnFailed(format!("{} pipe: {}", name, err)))
}

fn kill_group(pid: u32) {
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Runs in the forked child right before it execs the init stage.
fn enter_namespaces(report_tx: RawFd, go_rx: RawFd) -> io::Result<()> {
    // own process group, so a stop can signal the whole job at once
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    // the init stage inherits both of these
    fcntl(report_tx, FcntlArg::F_SETFD(FdFlag::empty()))?;
    fcntl(go_rx, FcntlArg::F_SETFD(FdFlag::empty()))?;
    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWPID)?;
    Ok(())
}

/// Blocks until every writer closes the report pipe. Anything written is a setup failure.
fn read_report(mut report: File) -> Option<String> {
    let mut message = String::new();
    match report.read_to_string(&mut message) {
        Ok(_) if message.is_empty() => None,
        Ok(_) => Some(message),
        Err(err) => Some(format!("reading init report: {}", err)),
    }
}
