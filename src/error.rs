use std::time::Duration;

/// Failure to establish a transport session.
///
/// Logged and turned into a `disconnected` status; never returned to the
/// code producing log records.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("endpoint rejected connection: {0}")]
    Rejected(String),
}

/// Failure while publishing a batch. The whole batch counts as dropped.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("session is not connected")]
    Disconnected,

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload of {size} bytes exceeds endpoint limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("endpoint rejected publish: {0}")]
    Rejected(String),
}

/// Failure of the worker execution boundary itself, as opposed to a
/// transport failure inside it. Triggers the one-time fallback to inline
/// execution.
#[derive(thiserror::Error, Debug, Clone)]
pub enum WorkerChannelError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("failed to build worker runtime: {0}")]
    Runtime(String),

    #[error("worker channel closed unexpectedly")]
    Closed,

    #[error("worker did not answer init within {0:?}")]
    InitTimeout(Duration),

    #[error("worker reported error: {0}")]
    Reported(String),
}
