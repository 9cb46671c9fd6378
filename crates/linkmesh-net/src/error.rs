use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("write buffer overflow: need {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("selection key cancelled")]
    Cancelled,
}
