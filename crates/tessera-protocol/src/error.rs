use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame tag {tag} does not match payload message {expected}")]
    TagMismatch { tag: u8, expected: u8 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
