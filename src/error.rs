use thiserror::Error;
use ulid::Ulid;

use crate::model::Span;

/// Startup-time configuration fault. Never recovered from at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration for business hours missing: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure reported by the record store. Propagated unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("no tentative appointment for this secret")]
    OfferNotFound,
    #[error("conflict with appointment {existing} on resource {resource_id}")]
    Conflict { resource_id: Ulid, existing: Ulid },
    #[error("resource {0} still has appointments")]
    HasAppointments(Ulid),
    #[error("invalid span [{}, {})", .0.start, .0.end)]
    InvalidSpan(Span),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    /// Caller-correctable; never retried internally.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Same answer for "never existed" and "already resolved".
    #[error("offer not found or expired")]
    NotFoundOrExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulingError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SchedulingError::InvalidRequest(msg.into())
    }
}
