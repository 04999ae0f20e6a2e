use converge_core::{CoreError, ExecutorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The desired state was rejected; nothing was applied.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A trigger or request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("scheduler is not running")]
    NotRunning,

    #[error("state store error: {0}")]
    Store(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SchedulerError {
    /// HTTP-style status code an API layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::InvalidModel(_) | SchedulerError::BadRequest(_) => 400,
            SchedulerError::NotRunning => 503,
            _ => 500,
        }
    }
}
