//! Administrative surface.
//!
//! Operations here are off the hot path: bulk reconciliation, guard
//! resets, mismatch triage and retention cleanup.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tally_core::Action;

use crate::auditor::{AccountFailure, BulkReconciliation, ReconciliationAuditor};
use crate::clock::{window_start, Clock};
use crate::config::RetentionConfig;
use crate::error::StoreError;
use crate::resilience::{BackoffTracker, CircuitBreaker, LimiterSweep, RateLimiter};
use crate::store::{LedgerStore, ReconciliationRecord};
use crate::telemetry::{self, events, TelemetryEvent, TelemetrySink};

/// Result of a retention cleanup run.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub cutoff: DateTime<Utc>,
    pub accounts_scanned: usize,
    pub accounts_cleaned: usize,

    /// Accounts left alone because they have unacknowledged mismatches
    pub accounts_held: Vec<String>,

    pub entries_deleted: usize,
    pub failures: Vec<AccountFailure>,
}

/// Counts removed by a guard maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceSweep {
    pub limiter_users_dropped: usize,
    pub limiter_resources_cleared: usize,
    pub backoffs_expired: usize,
}

impl From<(LimiterSweep, usize)> for MaintenanceSweep {
    fn from((limiter, backoffs_expired): (LimiterSweep, usize)) -> Self {
        Self {
            limiter_users_dropped: limiter.users_dropped,
            limiter_resources_cleared: limiter.resources_cleared,
            backoffs_expired,
        }
    }
}

#[derive(Clone)]
pub struct Admin {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) auditor: Arc<ReconciliationAuditor>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) backoff: Arc<BackoffTracker>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) retention: RetentionConfig,
}

impl Admin {
    pub async fn reconcile_all(&self) -> Result<BulkReconciliation, StoreError> {
        self.auditor.reconcile_all().await
    }

    /// Forget all rate-limit history for a user.
    pub fn reset_rate_limits(&self, user_id: &str) -> bool {
        let existed = self.limiter.reset_user(user_id);
        tracing::info!(user_id, existed, "Rate limits reset");
        existed
    }

    pub fn clear_backoff(&self, resource_id: &str) -> bool {
        self.backoff.clear(resource_id)
    }

    /// Close every circuit.
    pub fn reset_circuits(&self) {
        self.breaker.reset();
        tracing::info!("All circuits reset");
    }

    /// Drop expired limiter and backoff state.
    pub fn sweep(&self) -> MaintenanceSweep {
        let sweep = MaintenanceSweep::from((self.limiter.sweep(), self.backoff.sweep()));
        tracing::debug!(?sweep, "Guard state swept");
        sweep
    }

    pub async fn open_mismatches(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReconciliationRecord>, StoreError> {
        self.store.open_reconciliations(user_id).await
    }

    /// Mark a user's mismatches as reviewed. Balances are not touched.
    pub async fn acknowledge_mismatches(&self, user_id: &str) -> Result<usize, StoreError> {
        let count = self.store.acknowledge_reconciliations(user_id).await?;
        tracing::info!(user_id, count, "Reconciliation mismatches acknowledged");
        Ok(count)
    }

    /// Delete ledger entries older than the retention window.
    ///
    /// Only entries that precede a reset which is itself older than the
    /// cutoff are removed, so replaying what remains yields the same
    /// balances. Accounts with open mismatches keep their full history.
    pub async fn cleanup_retention(&self) -> Result<CleanupReport, StoreError> {
        let cutoff = window_start(self.clock.now(), self.retention.window);
        let users = self.store.list_accounts().await?;

        let mut report = CleanupReport {
            cutoff,
            accounts_scanned: users.len(),
            accounts_cleaned: 0,
            accounts_held: Vec::new(),
            entries_deleted: 0,
            failures: Vec::new(),
        };

        for user_id in users {
            match self.cleanup_account(&user_id, cutoff).await {
                Ok(AccountCleanup::Held) => report.accounts_held.push(user_id),
                Ok(AccountCleanup::Deleted(0)) => {}
                Ok(AccountCleanup::Deleted(n)) => {
                    report.accounts_cleaned += 1;
                    report.entries_deleted += n;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Retention cleanup failed");
                    report.failures.push(AccountFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            cutoff = %report.cutoff,
            scanned = report.accounts_scanned,
            cleaned = report.accounts_cleaned,
            held = report.accounts_held.len(),
            deleted = report.entries_deleted,
            "Retention cleanup finished"
        );
        telemetry::emit(
            self.telemetry.as_ref(),
            TelemetryEvent::new(events::RETENTION_CLEANUP)
                .param("accounts_scanned", report.accounts_scanned)
                .param("accounts_cleaned", report.accounts_cleaned)
                .param("accounts_held", report.accounts_held.len())
                .param("entries_deleted", report.entries_deleted),
        );
        Ok(report)
    }

    async fn cleanup_account(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<AccountCleanup, StoreError> {
        if !self.store.open_reconciliations(Some(user_id)).await?.is_empty() {
            return Ok(AccountCleanup::Held);
        }

        let entries = self.store.query_entries(user_id, None, None).await?;
        let boundary = entries
            .iter()
            .rev()
            .find(|e| e.action == Action::Reset && e.timestamp < cutoff);
        let Some(boundary) = boundary else {
            return Ok(AccountCleanup::Deleted(0));
        };

        let batch = self.retention.batch_size;
        let mut deleted = 0;
        loop {
            let n = self
                .store
                .delete_entries_before(user_id, &boundary.entry_id, cutoff, batch)
                .await?;
            deleted += n;
            if n < batch {
                break;
            }
        }
        if deleted > 0 {
            tracing::debug!(user_id, deleted, boundary = %boundary.entry_id, "Pruned ledger history");
        }
        Ok(AccountCleanup::Deleted(deleted))
    }
}

enum AccountCleanup {
    Held,
    Deleted(usize),
}
