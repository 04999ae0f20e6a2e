use std::time::Duration;

use thiserror::Error;

/// Errors raised while building the shared model or loading configuration.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid resource id '{0}': {1}")]
    InvalidResourceId(String, String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("code resolution failed for agent '{agent}': {message}")]
    CodeResolution { agent: String, message: String },
}

/// Errors crossing the executor boundary.
///
/// These never reach the caller of a trigger: the scheduler turns them into a
/// failed deploy for the affected resource.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("executor call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection to executor lost")]
    ConnectionLost,

    #[error("executor is shutting down")]
    ShuttingDown,

    #[error("failed to start executor: {0}")]
    Spawn(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("code resolution failed: {0}")]
    Code(String),
}
