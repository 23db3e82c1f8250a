//! Error taxonomy surfaced by the session engine.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("session {0} has ended")]
    SessionEnded(String),

    #[error("storage write failed: {0}")]
    TransientStorage(String),

    #[error("broadcast delivery failed: {0}")]
    Broadcast(String),

    /// The session worker stopped before answering (shutdown or panic).
    #[error("session worker unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable machine-readable tag used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::SessionEnded(_) => "session_ended",
            EngineError::TransientStorage(_) => "transient_storage",
            EngineError::Broadcast(_) => "broadcast",
            EngineError::Unavailable(_) => "unavailable",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
