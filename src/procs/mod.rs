//! Subprocess execution engine.
//!
//! - `spec`: turns an expanded command into an immutable [`SubprocSpec`]
//! - `runner`: starts one stage, directly or behind a tee worker
//! - `pipeline`: wires stages together and exposes [`CommandPipeline`]
//! - `jobs`: job table, process groups, fg/bg
//! - `pipe` and `status`: the plumbing under all of the above

pub mod jobs;
pub mod pipe;
pub mod pipeline;
pub mod runner;
pub mod spec;
pub mod status;

pub use jobs::{Job, JobControl, JobError, JobInfo, JobState};
pub use pipeline::{assemble, CommandPipeline, WaitOutcome};
pub use runner::{HostIo, NestedRunner, NoNested};
pub use spec::{ArgPiece, ArgWord, ExpandedCall, ExpandedRedirect, SpecBuilder, SubprocSpec};
pub use status::ExitOutcome;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcError {
    /// Malformed redirection, glob or splice
    #[error("{0}")]
    SpecBuild(String),
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    NotExecutable(String),
    #[error("alias cycle detected: {0}")]
    AliasCycle(String),
    #[error("failed to start {cmd}: {source}")]
    ChildStart {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd}: terminated by {signal}")]
    Signaled {
        cmd: String,
        signal: String,
        signo: i32,
    },
    #[error("command '{cmd}' returned non-zero exit status {code}")]
    CalledProcess { cmd: String, code: i32 },
    #[error("interrupted")]
    Interrupted,
}

impl ProcError {
    /// Conventional shell status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcError::NotFound(_) => 127,
            ProcError::NotExecutable(_) => 126,
            ProcError::ChildStart { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => 127,
                std::io::ErrorKind::PermissionDenied => 126,
                _ => 1,
            },
            ProcError::Signaled { signo, .. } => 128 + signo,
            ProcError::CalledProcess { code, .. } => status::shell_exit_code(*code),
            ProcError::Interrupted => 128 + libc::SIGINT,
            ProcError::SpecBuild(_) | ProcError::AliasCycle(_) => 1,
        }
    }
}
