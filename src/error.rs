use thiserror::Error;

#[derive(Error, Debug)]
pub enum TexschedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn compiler {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Compilation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Scheduler is no longer running")]
    SchedulerStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TexschedError>;
