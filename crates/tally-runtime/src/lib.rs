//! # tally-runtime
//!
//! Async runtime for the tally token ledger.
//!
//! This crate turns the pure model in `tally-core` into a service:
//! - [`TransactionCoordinator`]: the only path that mutates balances
//! - [`ReconciliationAuditor`]: replays ledgers and flags drift
//! - [`RateLimiter`], [`CircuitBreaker`], [`BackoffTracker`]: abuse and
//!   failure guards, checked before any store I/O
//! - [`LedgerStore`]: per-account transactional storage, in memory or SQLite
//!
//! ## Key Guarantees
//!
//! 1. **Atomic**: an entry and its account update commit together or not at all
//! 2. **Idempotent**: a request id repeated inside the dedup window is
//!    reported as `DuplicateRequest`, never applied twice
//! 3. **Bounded**: dedup and write finish within `write_timeout` or fail
//!    with `LedgerWriteFailed`, leaving nothing behind
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tally_core::Source;
//! use tally_runtime::{LedgerRuntime, MemoryStore, TransactionRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = LedgerRuntime::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let entry = runtime
//!     .coordinator
//!     .apply_transaction(TransactionRequest::debit("user-1", 3, "req-1", Source::Preview))
//!     .await?;
//! println!("applied {}", entry.entry_id);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod auditor;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod resilience;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use admin::{Admin, CleanupReport, MaintenanceSweep};
pub use auditor::{AccountFailure, BulkReconciliation, ReconciliationAuditor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CoordinatorConfig, LedgerConfig, RetentionConfig};
pub use coordinator::{
    TransactionCoordinator, TransactionRequest, LEDGER_WRITE_OPERATION, RESOURCE_ID_KEY,
};
pub use error::{LedgerError, StoreError};
pub use resilience::{
    BackoffActive, BackoffConfig, BackoffRecord, BackoffTracker, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, DownstreamFailure, Guard, GuardError, LimitScope,
    LimiterConfig, LimiterSweep, RateClass, RateLimitError, RateLimiter,
};
pub use runtime::{LedgerRuntime, LedgerRuntimeBuilder};
pub use store::{LedgerStore, MemoryStore, ReconciliationRecord, SqliteStore, StoreTransaction};
pub use telemetry::{
    events, MemorySink, NullSink, TelemetryError, TelemetryEvent, TelemetrySink, TracingSink,
};
