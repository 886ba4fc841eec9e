//! The init stage: the code path a job runs after the launcher re-executes our own binary.
//!
//! On entry the process is already inside fresh mount and network namespaces, and its next
//! child will be PID 1 of a fresh PID namespace. It first waits on the go pipe: the launcher
//! only sends the go byte once this process sits in the job's cgroup, so everything forked
//! afterwards is born inside it.
//!
//! Three processes make up a running job:
//!
//! * the host side (this process) stays outside the PID namespace, relays termination
//!   signals and exits with the command's exact status;
//! * the namespace init (PID 1) makes the mount tree private, mounts its own `/proc`, relays
//!   signals to the command and reaps whatever gets orphaned inside the namespace;
//! * the command itself, forked by the namespace init, drops privileges and is exec'd. It is
//!   not PID 1, so signals it has no handler for act on it normally.
//!
//! Any failure before the exec is written to the report pipe inherited from the launcher.
//! A successful exec closes the last copy of the pipe (it is close-on-exec), which is how the
//! launcher knows the command is running.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sys::prctl;
use nix::sys::signal::{self, kill, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, execv, fork, setgroups, setresgid, setresuid, ForkResult};
use nix::unistd::{Gid, Pid, Uid};
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

/// First argument that routes a re-executed binary into the init stage.
pub const INIT_MARKER: &str = "__joblib_init__";

const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Exit code used when the command never got exec'd.
const SETUP_FAILED: i32 = 127;

/// Pid the relay handler forwards to: the namespace init on the host side, the command
/// inside the namespace.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Everything the init stage needs, passed on the command line after `INIT_MARKER`.
///
/// Layout: `<report fd> <go fd> <uid:gid | -> <program> [args...]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitRequest {
    pub report_fd: RawFd,
    pub go_fd: RawFd,
    pub credentials: Option<(u32, u32)>,
    pub program: String,
    pub args: Vec<String>,
}

impl InitRequest {
    pub fn to_args(&self) -> Vec<String> {
        let credentials = match self.credentials {
            Some((uid, gid)) => format!("{}:{}", uid, gid),
            None => "-".to_string(),
        };
        let mut out = vec![
            self.report_fd.to_string(),
            self.go_fd.to_string(),
            credentials,
            self.program.clone(),
        ];
        out.extend(self.args.iter().cloned());
        out
    }

    pub fn from_args<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let report_fd = parse_fd(args.next(), "report")?;
        let go_fd = parse_fd(args.next(), "go")?;
        let credentials = match args.next().ok_or("missing credentials")?.as_str() {
            "-" => None,
            pair => {
                let (uid, gid) = pair
                    .split_once(':')
                    .ok_or_else(|| format!("bad credentials {:?}", pair))?;
                let uid = uid.parse().map_err(|err| format!("bad uid: {}", err))?;
                let gid = gid.parse().map_err(|err| format!("bad gid: {}", err))?;
                Some((uid, gid))
            }
        };
        let program = args.next().ok_or("missing program")?;
        Ok(Self {
            report_fd,
            go_fd,
            credentials,
            program,
            args: args.collect(),
        })
    }
}

fn parse_fd(arg: Option<String>, name: &str) -> Result<RawFd, String> {
    arg.ok_or_else(|| format!("missing {} fd", name))?
        .parse()
        .map_err(|err| format!("bad {} fd: {}", name, err))
}

/// How the command ended, as relayed from the namespace init to the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Exited(i32),
    Signaled(Signal),
}

impl Outcome {
    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Outcome::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(Outcome::Signaled(sig)),
            _ => None,
        }
    }

    fn encode(self) -> String {
        match self {
            Outcome::Exited(code) => format!("exit {}", code),
            Outcome::Signaled(sig) => format!("signal {}", sig as i32),
        }
    }

    fn decode(message: &str) -> Option<Self> {
        let (kind, value) = message.trim().split_once(' ')?;
        let value: i32 = value.parse().ok()?;
        match kind {
            "exit" => Some(Outcome::Exited(value)),
            "signal" => Signal::try_from(value).ok().map(Outcome::Signaled),
            _ => None,
        }
    }

    /// Shell convention, used where a signal death cannot be reproduced.
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Exited(code) => code,
            Outcome::Signaled(sig) => 128 + sig as i32,
        }
    }
}

/// Entry point for the init stage. `args` are the arguments following `INIT_MARKER`.
pub fn run<I>(args: I) -> !
where
    I: IntoIterator<Item = String>,
{
    let request = match InitRequest::from_args(args) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("joblib init: {}", err);
            std::process::exit(SETUP_FAILED);
        }
    };
    match supervise(&request) {
        Err(err) => fail(request.report_fd, &err),
        Ok(never) => match never {},
    }
}

/// Host side. Only returns on failure; on success the process exits from inside.
fn supervise(request: &InitRequest) -> Result<Infallible, String> {
    let fd = request.report_fd;
    // later copies must vanish when the command is exec'd
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| format!("report fd: {}", e))?;
    wait_for_go(request.go_fd)?;

    // Block the relayed signals until the child pid is known, so none get lost in between.
    let forwarded = forwarded_set();
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&forwarded), None)
        .map_err(|e| format!("sigprocmask: {}", e))?;
    let relay = SigAction::new(
        SigHandler::Handler(relay_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in FORWARDED_SIGNALS {
        // SAFETY: the handler only touches an atomic and calls kill(2).
        unsafe { signal::sigaction(sig, &relay) }.map_err(|e| format!("sigaction: {}", e))?;
    }

    let (outcome_rx, outcome_tx) =
        unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("outcome pipe: {}", e))?;

    // SAFETY: the init stage is single threaded.
    match unsafe { fork() }.map_err(|e| format!("fork: {}", e))? {
        ForkResult::Child => {
            let _ = unistd::close(outcome_rx);
            let err = match namespace_init(request, outcome_tx, &forwarded) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            fail(fd, &err);
        }
        ForkResult::Parent { child } => {
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            let _ = unistd::close(fd);
            let _ = unistd::close(outcome_tx);
            let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&forwarded), None);
            let own = wait_for(child);
            // SAFETY: the write end was closed above, this is the only owner of the read end.
            let relayed = read_outcome(unsafe { File::from_raw_fd(outcome_rx) });
            exit_like(relayed.unwrap_or(own))
        }
    }
}

/// Block until the launcher sends the go byte. EOF means the job was abandoned.
fn wait_for_go(go_fd: RawFd) -> Result<(), String> {
    // SAFETY: the launcher handed this fd to us alone.
    let mut go = unsafe { File::from_raw_fd(go_fd) };
    let mut byte = [0u8; 1];
    loop {
        match go.read(&mut byte) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err("launcher abandoned the job before starting it".into()),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(format!("go pipe: {}", err)),
        }
    }
}

/// Runs as PID 1 of the new namespace. Only returns on failure.
fn namespace_init(
    request: &InitRequest,
    outcome_tx: RawFd,
    forwarded: &SigSet,
) -> Result<Infallible, String> {
    // The parent lives outside our PID namespace, so getppid() reads 0 here and cannot be
    // used to detect an early parent exit.
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| format!("pdeathsig: {}", e))?;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| format!("make / private: {}", e))?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount /proc: {}", e))?;

    // SAFETY: still single threaded.
    match unsafe { fork() }.map_err(|e| format!("fork: {}", e))? {
        ForkResult::Child => {
            let err = match enter_job(request, forwarded) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            fail(request.report_fd, &err);
        }
        ForkResult::Parent { child } => {
            CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
            let _ = unistd::close(request.report_fd);
            let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(forwarded), None);
            let outcome = reap_until(child);
            let _ = unistd::write(outcome_tx, outcome.encode().as_bytes());
            // PID 1 cannot die of its own signal, so the host side re-raises it instead.
            std::process::exit(outcome.exit_code())
        }
    }
}

/// Runs in the command's process, right before the exec. Only returns on failure.
fn enter_job(request: &InitRequest, forwarded: &SigSet) -> Result<Infallible, String> {
    for sig in FORWARDED_SIGNALS {
        // SAFETY: restoring the default disposition.
        unsafe { signal::signal(sig, SigHandler::SigDfl) }
            .map_err(|e| format!("reset {}: {}", sig, e))?;
    }
    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(forwarded), None)
        .map_err(|e| format!("sigprocmask: {}", e))?;

    if let Some((uid, gid)) = request.credentials {
        drop_privileges(Uid::from_raw(uid), Gid::from_raw(gid))?;
    }

    let program = CString::new(request.program.as_str())
        .map_err(|_| format!("program {:?} contains a NUL byte", request.program))?;
    let mut argv = vec![program.clone()];
    for arg in &request.args {
        let arg = CString::new(arg.as_str())
            .map_err(|_| format!("argument {:?} contains a NUL byte", arg))?;
        argv.push(arg);
    }
    execv(&program, &argv).map_err(|e| format!("exec {}: {}", request.program, e))
}

/// Groups first, then gid, then uid: once the uid is gone we could no longer change the rest.
fn drop_privileges(uid: Uid, gid: Gid) -> Result<(), String> {
    setgroups(&[gid]).map_err(|e| format!("setgroups: {}", e))?;
    setresgid(gid, gid, gid).map_err(|e| format!("setresgid({}): {}", gid, e))?;
    setresuid(uid, uid, uid).map_err(|e| format!("setresuid({}): {}", uid, e))?;
    Ok(())
}

fn forwarded_set() -> SigSet {
    let mut set = SigSet::empty();
    for sig in FORWARDED_SIGNALS {
        set.add(sig);
    }
    set
}

fn wait_for(child: Pid) -> Outcome {
    loop {
        match waitpid(child, None) {
            Ok(status) => match Outcome::from_wait(status) {
                Some(outcome) => return outcome,
                None => continue,
            },
            Err(Errno::EINTR) => continue,
            Err(err) => {
                eprintln!("joblib init: waitpid: {}", err);
                std::process::exit(SETUP_FAILED);
            }
        }
    }
}

/// Reap every child until `command` exits. Orphans inside the namespace land here too.
fn reap_until(command: Pid) -> Outcome {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(status) if status.pid() == Some(command) => {
                if let Some(outcome) = Outcome::from_wait(status) {
                    return outcome;
                }
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(err) => {
                eprintln!("joblib init: waitpid: {}", err);
                return Outcome::Exited(SETUP_FAILED);
            }
        }
    }
}

fn read_outcome(mut pipe: File) -> Option<Outcome> {
    let mut message = String::new();
    pipe.read_to_string(&mut message).ok()?;
    Outcome::decode(&message)
}

/// Exit the way the command did so the supervisor sees its real status.
fn exit_like(outcome: Outcome) -> ! {
    if let Outcome::Signaled(sig) = outcome {
        // SAFETY: restoring the default disposition before re-raising.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
        let mut set = SigSet::empty();
        set.add(sig);
        let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
        let _ = signal::raise(sig);
    }
    std::process::exit(outcome.exit_code())
}

fn fail(fd: RawFd, message: &str) -> ! {
    let _ = unistd::write(fd, message.as_bytes());
    std::process::exit(SETUP_FAILED)
}

extern "C" fn relay_signal(signal: nix::libc::c_int) {
    let child = CHILD_PID.load(Ordering::SeqCst);
    if child > 0 {
        if let Ok(sig) = Signal::try_from(signal) {
            let _ = kill(Pid::from_raw(child), sig);
        }
    }
}
