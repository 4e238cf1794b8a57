//! Reconciliation Auditor.
//!
//! Replays an account's ledger through the balance engine and compares the
//! result with the live projection. Mismatches are persisted for operator
//! review and never corrected automatically.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tally_core::{BalanceEngine, Balances, ReconciliationResult};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::LedgerStore;
use crate::telemetry::{self, events, TelemetryEvent, TelemetrySink, TracingSink};

/// An account a bulk operation could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountFailure {
    pub user_id: String,
    pub error: String,
}

/// Summary of a bulk reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReconciliation {
    pub checked: usize,
    pub balanced: usize,
    pub mismatched: Vec<ReconciliationResult>,
    pub failures: Vec<AccountFailure>,
}

impl BulkReconciliation {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.failures.is_empty()
    }
}

pub struct ReconciliationAuditor {
    store: Arc<dyn LedgerStore>,
    engine: BalanceEngine,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    concurrency: usize,
}

impl ReconciliationAuditor {
    pub fn new(store: Arc<dyn LedgerStore>, engine: BalanceEngine) -> Self {
        Self {
            store,
            engine,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(TracingSink),
            concurrency: 8,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Accounts reconciled at once by [`reconcile_all`](Self::reconcile_all).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Reconcile one account.
    ///
    /// Entries and projection are read inside one store transaction so a
    /// concurrent write cannot produce a false mismatch. The transaction is
    /// dropped without writing.
    pub async fn reconcile(&self, user_id: &str) -> Result<ReconciliationResult, StoreError> {
        let (entries, account) = {
            let mut txn = self.store.begin(user_id).await?;
            let entries = txn.query_entries(None, None).await?;
            let account = txn.get_account().await?;
            (entries, account)
        };

        let expected = self.engine.replay(&entries);
        let last_entry_id = entries.last().map(|e| e.entry_id.as_str());

        let (actual, recorded_last) = match &account {
            Some(account) => (account.balances, account.last_ledger_entry_id.as_deref()),
            // An account with no projection and no entries is implicitly at
            // plan defaults; with entries, its projection is simply missing.
            None if entries.is_empty() => (self.engine.opening_balances(), None),
            None => (Balances::ZERO, None),
        };

        let last_entry_consistent = recorded_last == last_entry_id;
        let expected_balance = expected.total();
        let actual_balance = actual.total();

        let result = ReconciliationResult {
            user_id: user_id.to_string(),
            expected_balance,
            actual_balance,
            difference: expected_balance.abs_diff(actual_balance),
            is_balanced: expected == actual && last_entry_consistent,
            expected,
            actual,
            last_entry_consistent,
            entries_replayed: entries.len(),
            reconciled_at: self.clock.now(),
        };

        if result.is_balanced {
            tracing::debug!(user_id, entries = result.entries_replayed, "Account reconciled");
            telemetry::emit(
                self.telemetry.as_ref(),
                TelemetryEvent::new(events::RECONCILE_OK)
                    .param("user_id", user_id)
                    .param("entries", result.entries_replayed)
                    .param("balance", result.actual_balance),
            );
            return Ok(result);
        }

        tracing::error!(
            user_id,
            expected = %result.expected,
            actual = %result.actual,
            difference = result.difference,
            last_entry_consistent,
            "Reconciliation mismatch"
        );
        telemetry::emit(
            self.telemetry.as_ref(),
            TelemetryEvent::new(events::RECONCILE_MISMATCH)
                .param("user_id", user_id)
                .param("expected_balance", result.expected_balance)
                .param("actual_balance", result.actual_balance)
                .param("difference", result.difference)
                .param("last_entry_consistent", last_entry_consistent),
        );
        self.store.record_reconciliation(&result).await?;

        Ok(result)
    }

    /// Reconcile every known account, continuing past individual failures.
    pub async fn reconcile_all(&self) -> Result<BulkReconciliation, StoreError> {
        let users = self.store.list_accounts().await?;
        tracing::info!(accounts = users.len(), "Starting bulk reconciliation");

        let outcomes: Vec<_> = stream::iter(users)
            .map(|user_id| async move {
                let outcome = self.reconcile(&user_id).await;
                (user_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BulkReconciliation::default();
        for (user_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    report.checked += 1;
                    if result.is_balanced {
                        report.balanced += 1;
                    } else {
                        report.mismatched.push(result);
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Reconciliation failed");
                    report.failures.push(AccountFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.mismatched.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        report.failures.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        tracing::info!(
            checked = report.checked,
            balanced = report.balanced,
            mismatched = report.mismatched.len(),
            failed = report.failures.len(),
            "Bulk reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::telemetry::MemorySink;
    use chrono::Utc;
    use tally_core::{Account, Action, LedgerEntry, Metadata, PlanDefaults, Source};

    fn entry(user: &str, id: &str, action: Action, tokens: u64) -> LedgerEntry {
        LedgerEntry {
            entry_id: id.to_string(),
            user_id: user.to_string(),
            action,
            tokens,
            request_id: format!("req-{id}"),
            timestamp: Utc::now(),
            source: Source::Admin,
            metadata: Metadata::new(),
        }
    }

    /// Write entries and the projection the engine derives from them.
    async fn seed(store: &MemoryStore, user: &str, entries: Vec<LedgerEntry>) {
        let engine = BalanceEngine::default();
        let balances = engine.replay(&entries);
        let last = entries.last().map(|e| e.entry_id.clone());

        let mut txn = store.begin(user).await.unwrap();
        for e in entries {
            txn.append_entry(e).await.unwrap();
        }
        txn.upsert_account(Account {
            user_id: user.to_string(),
            balances,
            last_ledger_entry_id: last,
            last_updated: Utc::now(),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();
    }

    fn auditor(store: Arc<MemoryStore>, sink: Arc<MemorySink>) -> ReconciliationAuditor {
        ReconciliationAuditor::new(store, BalanceEngine::default()).with_telemetry(sink)
    }

    #[tokio::test]
    async fn test_consistent_account_is_balanced() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        seed(
            &store,
            "u1",
            vec![
                entry("u1", "e1", Action::Credit, 100),
                entry("u1", "e2", Action::Debit, 55),
            ],
        )
        .await;

        let result = auditor(store.clone(), sink.clone()).reconcile("u1").await.unwrap();
        assert!(result.is_balanced);
        assert_eq!(result.difference, 0);
        assert_eq!(result.expected_balance, 85);
        assert_eq!(sink.count(events::RECONCILE_OK), 1);
        assert!(store.open_reconciliations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_projection_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        seed(&store, "u1", vec![entry("u1", "e1", Action::Debit, 25)]).await;

        let mut account = store.get_account("u1").await.unwrap().unwrap();
        account.balances.monthly_tokens += 7;
        store.force_account(account);

        let result = auditor(store.clone(), sink.clone()).reconcile("u1").await.unwrap();
        assert!(!result.is_balanced);
        assert_eq!(result.difference, 7);
        assert!(result.last_entry_consistent);

        let open = store.open_reconciliations(Some("u1")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].result, result);
        assert_eq!(sink.count(events::RECONCILE_MISMATCH), 1);
    }

    #[tokio::test]
    async fn test_stale_back_reference_is_a_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        seed(&store, "u1", vec![entry("u1", "e1", Action::Credit, 5)]).await;

        let mut account = store.get_account("u1").await.unwrap().unwrap();
        account.last_ledger_entry_id = Some("e0".to_string());
        store.force_account(account);

        let result = auditor(store, sink).reconcile("u1").await.unwrap();
        assert_eq!(result.difference, 0);
        assert!(!result.last_entry_consistent);
        assert!(!result.is_balanced);
    }

    #[tokio::test]
    async fn test_unknown_account_is_balanced_at_defaults() {
        let store = Arc::new(MemoryStore::new());
        let result = auditor(store, Arc::new(MemorySink::new()))
            .reconcile("nobody")
            .await
            .unwrap();
        assert!(result.is_balanced);
        assert_eq!(
            result.actual,
            PlanDefaults::default().opening_balances()
        );
    }

    #[tokio::test]
    async fn test_bulk_continues_past_mismatches() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        for user in ["a", "b", "c"] {
            seed(&store, user, vec![entry(user, &format!("{user}-1"), Action::Credit, 10)]).await;
        }
        let mut broken = store.get_account("b").await.unwrap().unwrap();
        broken.balances.free_actions = 0;
        store.force_account(broken);

        let report = auditor(store, sink)
            .with_concurrency(2)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.balanced, 2);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].user_id, "b");
        assert!(!report.is_clean());
    }
}
