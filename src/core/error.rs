/// Errors surfaced by the sync engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid value for `{key}`: {reason}")]
    Validation { key: String, reason: String },

    #[error("target `{0}` is busy: a sync is already running")]
    TargetBusy(String),

    #[error("target `{0}` not found")]
    TargetNotFound(String),

    #[error("target `{0}` is disabled")]
    TargetDisabled(String),

    #[error("job `{0}` not found")]
    JobNotFound(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
