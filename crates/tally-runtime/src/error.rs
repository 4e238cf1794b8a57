//! Error taxonomy for ledger operations.

use std::time::Duration;
use thiserror::Error;

use crate::resilience::{BackoffActive, LimitScope, RateLimitError};

/// Errors returned by the transaction coordinator.
///
/// `RateLimited`, `ServiceUnavailable`, `TemporarilyUnavailable` and
/// `DuplicateRequest` are routine outcomes; see [`LedgerError::is_routine`].
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Rate limit exceeded ({scope}), retry after {retry_after:?}")]
    RateLimited {
        scope: LimitScope,
        retry_after: Duration,
    },

    #[error("Duplicate request '{request_id}' already applied as entry {entry_id}")]
    DuplicateRequest { request_id: String, entry_id: String },

    #[error("Service unavailable: circuit open for '{operation}'")]
    ServiceUnavailable { operation: String },

    #[error("Resource '{resource}' temporarily unavailable, retry after {retry_after:?}")]
    TemporarilyUnavailable {
        resource: String,
        retry_after: Duration,
    },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: i64 },

    #[error("Ledger write failed: {0}")]
    LedgerWriteFailed(String),

    #[error("Ledger read failed: {0}")]
    LedgerReadFailed(String),
}

impl LedgerError {
    /// Expected rejections that callers handle locally; not faults.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            LedgerError::RateLimited { .. }
                | LedgerError::DuplicateRequest { .. }
                | LedgerError::ServiceUnavailable { .. }
                | LedgerError::TemporarilyUnavailable { .. }
        )
    }

    /// Whether the caller may retry with the same request id.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::LedgerWriteFailed(_)
                | LedgerError::LedgerReadFailed(_)
                | LedgerError::RateLimited { .. }
                | LedgerError::ServiceUnavailable { .. }
                | LedgerError::TemporarilyUnavailable { .. }
        )
    }

    /// Retry hint, when the rejection carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LedgerError::RateLimited { retry_after, .. }
            | LedgerError::TemporarilyUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short stable name for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InvalidArgument(_) => "invalid_argument",
            LedgerError::RateLimited { .. } => "rate_limited",
            LedgerError::DuplicateRequest { .. } => "duplicate_request",
            LedgerError::ServiceUnavailable { .. } => "service_unavailable",
            LedgerError::TemporarilyUnavailable { .. } => "temporarily_unavailable",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::LedgerWriteFailed(_) => "ledger_write_failed",
            LedgerError::LedgerReadFailed(_) => "ledger_read_failed",
        }
    }

    /// A store fault on a read-only path.
    pub fn read_failed(e: StoreError) -> Self {
        LedgerError::LedgerReadFailed(e.to_string())
    }
}

impl From<RateLimitError> for LedgerError {
    fn from(e: RateLimitError) -> Self {
        LedgerError::RateLimited {
            scope: e.scope,
            retry_after: e.retry_after,
        }
    }
}

impl From<BackoffActive> for LedgerError {
    fn from(e: BackoffActive) -> Self {
        LedgerError::TemporarilyUnavailable {
            resource: e.resource,
            retry_after: e.retry_after,
        }
    }
}

/// Store faults on the write path. Read-only operations use
/// [`LedgerError::read_failed`] instead.
impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        LedgerError::LedgerWriteFailed(e.to_string())
    }
}

/// Errors from a ledger store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Transaction rejected: {0}")]
    InvalidTransaction(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
