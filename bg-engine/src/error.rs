use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("responder error: {0}")]
    Responder(String),

    #[error("responder timed out after {0:?}")]
    ResponderTimeout(Duration),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Transient failures are the ones a fallback replay may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Responder(_) | Self::ResponderTimeout(_))
    }
}
