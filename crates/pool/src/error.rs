use converge_core::ExecutorError;
use converge_ipc::IpcError;
use thiserror::Error;

/// Errors from pool managers and their members.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("failed to create pool member {key}: {message}")]
    Create { key: String, message: String },

    #[error("failed to spawn executor process: {0}")]
    Spawn(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("transport error: {0}")]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<PoolError> for ExecutorError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ShuttingDown(_) => ExecutorError::ShuttingDown,
            PoolError::Spawn(message) => ExecutorError::Spawn(message),
            PoolError::Ipc(ipc) => ipc_error(ipc),
            PoolError::Executor(inner) => inner,
            other => ExecutorError::Spawn(other.to_string()),
        }
    }
}

/// Map a transport failure onto the executor error the scheduler understands.
pub(crate) fn ipc_error(err: IpcError) -> ExecutorError {
    match err {
        IpcError::Timeout(after) => ExecutorError::Timeout(after),
        IpcError::ConnectionLost => ExecutorError::ConnectionLost,
        IpcError::Remote(message) => ExecutorError::Remote(message),
        other => ExecutorError::Remote(other.to_string()),
    }
}
