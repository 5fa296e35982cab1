use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler '{name}' is already running (PID {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("Scheduler '{0}' is not running")]
    NotRunning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Fork failed: {0}")]
    Fork(#[source] std::io::Error),

    #[error("Failed to bind command socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Step executor panicked: {0}")]
    StepPanicked(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Storage(err.to_string())
    }
}
