use thiserror::Error;

use crate::message::MessageId;

/// Errors produced while reading or writing framed protocol messages.
///
/// Every variant except [`CodecError::Io`] is scoped to a single frame: the
/// stream is still synchronized afterwards and the next frame can be read.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("message of {declared} bytes exceeds limit of {limit} bytes")]
    TooLarge { declared: usize, limit: usize },

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Body was valid JSON but not a JSON-RPC message object.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        id: Option<MessageId>,
        reason: String,
    },
}

impl CodecError {
    /// Whether the stream can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

pub type CoreResult<T> = Result<T, CodecError>;
