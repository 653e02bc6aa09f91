//! Run untrusted code snippets to completion under OS-enforced ceilings.
//!
//! A request passes through a lexical [`policy`] filter, waits for a slot in
//! the [`executor`], runs once in a disposable interpreter process owned by
//! the [`runner`], and comes back as an [`ExecutionResult`] built by the
//! [`assembler`].

use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

pub mod assembler;
pub mod config;
pub mod echo;
pub mod executor;
pub mod policy;
pub mod reaper;
pub mod runner;

pub use assembler::{ExecutionResult, Outcome};
pub use config::{ExecutionLimits, SandboxConfig};
pub use executor::{ExecutionRequest, Executor, HealthReport};
pub use policy::{Category, ForbiddenPattern, PolicyFilter, PolicyViolation};
pub use runner::{CapturedOutput, ProcessRunner, Runner, RunnerOutcome, RunnerStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to create temporary directory: {source}")]
    UnableToCreateTempDir { source: io::Error },
    #[error("Unable to create source file: {source}")]
    UnableToCreateSourceFile { source: io::Error },
    #[error("Unable to set permissions for source file: {source}")]
    UnableToSetSourcePermissions { source: io::Error },
    #[error("Unable to start the interpreter: {source}")]
    UnableToStartInterpreter { source: io::Error },
    #[error("Unable to wait for the worker process: {source}")]
    UnableToWaitForWorker { source: io::Error },
    #[error("Worker process was still running {} ms after being killed", grace.as_millis())]
    WorkerNotTerminated { grace: Duration },
    #[error("Unable to read {stream} from the worker: {source}")]
    UnableToReadOutput {
        stream: &'static str,
        source: io::Error,
    },
    #[error("Worker {stream} was still open {} ms after the worker exited", grace.as_millis())]
    OutputStillOpen {
        stream: &'static str,
        grace: Duration,
    },
    #[error("Output reader task failed: {source}")]
    OutputReaderFailed { source: tokio::task::JoinError },
    #[error("{remaining} escaped worker process(es) survived {} ms of killing", grace.as_millis())]
    StrayProcessesSurvived { remaining: usize, grace: Duration },
    #[error("Stray process sweep failed: {source}")]
    ReaperFailed { source: tokio::task::JoinError },
    #[error("Executor is shutting down")]
    ExecutorClosed,
    #[error("Execution queue is full ({limit} waiting)")]
    QueueFull { limit: usize },
    #[error("Request waited {} ms for a free slot and ran out of time", waited.as_millis())]
    QueueTimedOut { waited: Duration },
    #[error("Language '{requested}' is not supported. Only '{supported}' is supported.")]
    UnsupportedLanguage {
        requested: String,
        supported: String,
    },
    #[error("Invalid execution limits: {reason}")]
    InvalidLimits { reason: String },
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnvOverride { key: &'static str, value: String },
    #[error("Unable to read configuration file {}: {source}", path.display())]
    UnableToReadConfig { path: PathBuf, source: io::Error },
    #[error("Unable to parse configuration file {}: {source}", path.display())]
    UnableToParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Unable to read {}: {source}", path.display())]
    UnableToReadInput { path: PathBuf, source: io::Error },
    #[error("Unable to parse the request: {source}")]
    UnableToParseRequest { source: serde_json::Error },
    #[error("Unable to serialize the response: {source}")]
    UnableToSerialize { source: serde_json::Error },
}

impl Error {
    /// The caller may try again later; nothing about the request was wrong.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull { .. } | Error::QueueTimedOut { .. })
    }

    /// Operational faults in the sandbox itself, as opposed to bad input.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::UnableToCreateTempDir { .. }
                | Error::UnableToCreateSourceFile { .. }
                | Error::UnableToSetSourcePermissions { .. }
                | Error::UnableToStartInterpreter { .. }
                | Error::UnableToWaitForWorker { .. }
                | Error::WorkerNotTerminated { .. }
                | Error::UnableToReadOutput { .. }
                | Error::OutputStillOpen { .. }
                | Error::OutputReaderFailed { .. }
                | Error::StrayProcessesSurvived { .. }
                | Error::ReaperFailed { .. }
                | Error::ExecutorClosed
        )
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
