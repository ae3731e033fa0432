use thiserror::Error;

/// Errors produced by the wmx protocol layer.
#[derive(Debug, Error)]
pub enum WmxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    Disconnected,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type WmxResult<T> = Result<T, WmxError>;
