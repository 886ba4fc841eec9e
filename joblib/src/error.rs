use nix::errno::Errno;
use std::{io, path::PathBuf, result};

use crate::types::Principal;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{principal} is not permitted to run {}", .program.display())]
    AuthorizationDenied {
        principal: Principal,
        program: PathBuf,
    },
    #[error("failed to spawn job: {0}")]
    SpawnFailed(String),
    #[error("cgroup controller {controller} unavailable: {source}")]
    CgroupUnsupported {
        controller: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to create cgroup {}: {source}", .path.display())]
    CgroupCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cgroup operation on {} failed: {source}", .path.display())]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No such job exists")]
    NotFound,
    #[error("failed to signal job process: {0}")]
    SignalFailed(Errno),
    #[error("job coordinator has shut down")]
    Shutdown,
}

pub type Result<T> = result::Result<T, Error>;
