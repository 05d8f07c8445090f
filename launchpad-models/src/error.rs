//! Error taxonomy shared across the workspace.
//!
//! Validation, authorization, and transition errors surface synchronously
//! to callers with no state mutation. Pipeline errors are absorbed by the
//! lifecycle engine and expressed as a later `failed` transition.
//! Notification errors are never propagated, only audited.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Parameters rejected against the template schema before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Wrong role, or a requester attempting to approve their own request.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Action not legal from the entity's current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Lost optimistic-concurrency race, or a second active operation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Pipeline trigger failed at the transport layer (network, timeout, 5xx).
    #[error("pipeline unavailable: {0}")]
    PipelineUnavailable(String),

    /// Pipeline rejected the run request as malformed.
    #[error("pipeline rejected request: {0}")]
    PipelineRejected(String),

    /// Notification transport failure; audited, never returned to callers.
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Human-readable cause recorded on terminal `failed` states.
    pub fn failure_reason(&self) -> String {
        self.to_string()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}
