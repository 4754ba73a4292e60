use aoc_core::ContractError;
use thiserror::Error;

/// Failure taxonomy for the stream client.
///
/// Only [`StreamError::InvalidParameter`] is fatal. Transport failures drive
/// the reconnect loop and malformed messages are dropped one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ContractError),
    #[error("stream client has stopped")]
    Stopped,
}

impl StreamError {
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidParameter { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::Transport(_) => "transport_failure",
            Self::MalformedMessage(_) => "malformed_message",
            Self::Stopped => "stopped",
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
