use std::fmt;

/// Lifecycle state of a job.
///
/// `Starting` is the only initial state. `Exited`, `Killed` and `StartFailed`
/// are terminal; nothing transitions out of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Starting,
    Running,
    Exited { code: i32 },
    Killed { signal: i32 },
    StartFailed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Exited { .. } | JobStatus::Killed { .. } | JobStatus::StartFailed { .. }
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Starting => f.write_str("starting"),
            JobStatus::Running => f.write_str("running"),
            JobStatus::Exited { code } => write!(f, "exited({})", code),
            JobStatus::Killed { signal } => write!(f, "killed({})", signal),
            JobStatus::StartFailed { reason } => write!(f, "start-failed: {}", reason),
        }
    }
}
