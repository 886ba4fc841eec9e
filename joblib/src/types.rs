use chrono::{DateTime, Utc};
use std::{fmt, path::PathBuf, str::FromStr};
use uuid::Uuid;

use crate::events::JobStatus;

pub type Program = String;
pub type Args = Vec<String>;
pub type Principal = String;

/// Opaque job handle, rendered as 32 lowercase hex digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_simple())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSource::Stdout => f.write_str("stdout"),
            OutputSource::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured line of job output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
    /// Position in the job's capture order, starting at 0.
    pub seq: u64,
    pub source: OutputSource,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Point-in-time snapshot of a job record.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub job_id: JobId,
    pub owner: Principal,
    pub program: PathBuf,
    pub args: Args,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub status: JobStatus,
}
