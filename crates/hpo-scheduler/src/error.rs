//! Error types for the scheduler crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(
        "invalid task name `{0}`: must be 1-63 chars, lowercase alphanumeric or '-', starting and ending alphanumeric"
    )]
    InvalidTaskName(String),

    #[error("kubectl {0} failed: {1}")]
    KubectlFailed(&'static str, String),

    #[error("kubectl binary not found on PATH")]
    KubectlMissing,

    #[error("scheduler stopped before this trial finished")]
    SchedulerStopped,

    #[error("trial {0} failed: {1}")]
    RemoteTrialFailure(u64, String),

    #[error("trial {0} exceeded its timeout")]
    TrialTimedOut(u64),

    #[error("task queue is full ({0} tasks already defined)")]
    TaskLimitReached(usize),
}
