use thiserror::Error;

pub type KvmeshResult<T> = Result<T, KvmeshError>;

#[derive(Debug, Error)]
pub enum KvmeshError {
    #[error("transport not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("checksum mismatch on message {id}")]
    Checksum { id: String },

    #[error("coordinator has been disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
