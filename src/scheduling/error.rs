use thiserror::Error;
use ulid::Ulid;

use crate::tz::TzError;

#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Malformed or missing input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The slot was taken by another booking; re-query available slots.
    #[error("slot no longer available: overlaps appointment {0}")]
    Conflict(Ulid),
    /// Contention or timeout on the provider's atomic unit.
    #[error("appointment store busy: {0}")]
    TransientStore(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(String),
}

impl SchedulingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulingError::TransientStore(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::Validation(_) => "validation",
            SchedulingError::Conflict(_) => "conflict",
            SchedulingError::TransientStore(_) => "transient",
            SchedulingError::Config(_) => "config",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::AlreadyExists(_) => "already_exists",
            SchedulingError::LimitExceeded(_) => "limit",
            SchedulingError::Store(_) => "store",
        }
    }
}

impl From<TzError> for SchedulingError {
    fn from(e: TzError) -> Self {
        match e {
            TzError::InvalidZone(_) => SchedulingError::Config(e.to_string()),
            TzError::InvalidCivilTime { .. } | TzError::OutOfRange(_) => {
                SchedulingError::Validation(e.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification dispatcher unavailable")]
    Unavailable,
    #[error("delivery failed: {0}")]
    Delivery(String),
}
