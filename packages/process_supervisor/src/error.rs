use thiserror::Error;

/// Errors that can occur while driving a process actor.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("failed to signal process: {0}")]
    KillFailed(String),
    #[error("process actor is gone")]
    ActorGone,
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        ProcessError::SpawnFailed(err.to_string())
    }
}
