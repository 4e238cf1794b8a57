//! In-memory ledger store.
//!
//! Each account has its own async mutex, held for the life of a
//! transaction, so transactions on one account are serialized while
//! different accounts proceed in parallel. Writes are buffered in the
//! transaction and published under a single write lock on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{Account, LedgerEntry, ReconciliationResult};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    check_account_owner, check_entry_owner, check_paired_writes, window_entries, LedgerStore,
    ReconciliationRecord, StoreTransaction,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Vec<LedgerEntry>>,
    accounts: HashMap<String, Account>,
    reconciliations: Vec<ReconciliationRecord>,
}

/// Lock map size below which idle locks are never pruned.
const MIN_LOCK_PRUNE: usize = 64;

/// Per-account transaction locks.
///
/// A lock nobody holds or waits on is referenced only by the map and can
/// be dropped; the next transaction for that account creates a fresh one.
#[derive(Debug, Default)]
struct AccountLocks {
    by_user: HashMap<String, Arc<AsyncMutex<()>>>,
    prune_at: usize,
}

impl AccountLocks {
    fn get(&mut self, user_id: &str) -> Arc<AsyncMutex<()>> {
        if self.by_user.len() >= self.prune_at {
            self.by_user.retain(|_, lock| Arc::strong_count(lock) > 1);
            self.prune_at = (self.by_user.len() * 2).max(MIN_LOCK_PRUNE);
        }
        self.by_user.entry(user_id.to_string()).or_default().clone()
    }
}

/// Process-local store for tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    account_locks: Mutex<AccountLocks>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn account_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        self.account_locks.lock().get(user_id)
    }

    /// Overwrite an account projection outside of any transaction.
    ///
    /// Bypasses the ledger entirely; used to seed fixtures and to simulate
    /// corruption in reconciliation drills.
    pub fn force_account(&self, account: Account) {
        self.state
            .write()
            .accounts
            .insert(account.user_id.clone(), account);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self, user_id: &str) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.account_lock(user_id).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            user_id: user_id.to_string(),
            _guard: guard,
            state: Arc::clone(&self.state),
            pending_entries: Vec::new(),
            pending_account: None,
        }))
    }

    async fn query_entries(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state.read();
        let entries = state.entries.get(user_id).into_iter().flatten().cloned();
        Ok(window_entries(entries, since, limit))
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.state.read().accounts.get(user_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut ids: Vec<String> = state
            .accounts
            .keys()
            .chain(state.entries.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn delete_entries_before(
        &self,
        user_id: &str,
        boundary_entry_id: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        // Same lock as transactions so cleanup never races a write
        let _guard = self.account_lock(user_id).lock_owned().await;
        let mut state = self.state.write();
        let Some(entries) = state.entries.get_mut(user_id) else {
            return Ok(0);
        };
        let Some(boundary) = entries.iter().position(|e| e.entry_id == boundary_entry_id) else {
            return Err(StoreError::InvalidTransaction(format!(
                "boundary entry {boundary_entry_id} not found for '{user_id}'"
            )));
        };

        let mut remaining = limit;
        let mut index = 0;
        entries.retain(|e| {
            let keep = index >= boundary || e.timestamp >= older_than || remaining == 0;
            index += 1;
            if !keep {
                remaining -= 1;
            }
            keep
        });
        Ok(limit - remaining)
    }

    async fn record_reconciliation(&self, result: &ReconciliationResult) -> Result<i64, StoreError> {
        let mut state = self.state.write();
        let id = i64::try_from(state.reconciliations.len()).unwrap_or(i64::MAX) + 1;
        state.reconciliations.push(ReconciliationRecord {
            id,
            result: result.clone(),
            acknowledged: false,
        });
        Ok(id)
    }

    async fn open_reconciliations(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReconciliationRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .reconciliations
            .iter()
            .filter(|r| !r.acknowledged)
            .filter(|r| user_id.map_or(true, |u| r.result.user_id == u))
            .cloned()
            .collect())
    }

    async fn acknowledge_reconciliations(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let mut count = 0;
        for record in state
            .reconciliations
            .iter_mut()
            .filter(|r| !r.acknowledged && r.result.user_id == user_id)
        {
            record.acknowledged = true;
            count += 1;
        }
        Ok(count)
    }
}

struct MemoryTransaction {
    user_id: String,
    _guard: OwnedMutexGuard<()>,
    state: Arc<RwLock<MemoryState>>,
    pending_entries: Vec<LedgerEntry>,
    pending_account: Option<Account>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn query_entries(
        &mut self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state.read();
        let committed = state.entries.get(&self.user_id).into_iter().flatten();
        let entries = committed.chain(self.pending_entries.iter()).cloned();
        Ok(window_entries(entries, since, limit))
    }

    async fn get_account(&mut self) -> Result<Option<Account>, StoreError> {
        if let Some(account) = &self.pending_account {
            return Ok(Some(account.clone()));
        }
        Ok(self.state.read().accounts.get(&self.user_id).cloned())
    }

    async fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        check_entry_owner(&self.user_id, &entry)?;
        self.pending_entries.push(entry);
        Ok(())
    }

    async fn upsert_account(&mut self, account: Account) -> Result<(), StoreError> {
        check_account_owner(&self.user_id, &account)?;
        self.pending_account = Some(account);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        check_paired_writes(this.pending_entries.len(), this.pending_account.is_some())?;

        let mut state = this.state.write();
        if !this.pending_entries.is_empty() {
            state
                .entries
                .entry(this.user_id.clone())
                .or_default()
                .extend(this.pending_entries);
        }
        if let Some(account) = this.pending_account {
            state.accounts.insert(this.user_id.clone(), account);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tally_core::{Action, Balances, Metadata, Source};

    fn entry(user: &str, id: &str, at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            entry_id: id.to_string(),
            user_id: user.to_string(),
            action: Action::Credit,
            tokens: 10,
            request_id: format!("req-{id}"),
            timestamp: at,
            source: Source::Purchase,
            metadata: Metadata::new(),
        }
    }

    fn account(user: &str, last: &str, at: DateTime<Utc>) -> Account {
        Account {
            user_id: user.to_string(),
            balances: Balances::new(0, 0, 10),
            last_ledger_entry_id: Some(last.to_string()),
            last_updated: at,
        }
    }

    async fn write(store: &MemoryStore, user: &str, id: &str, at: DateTime<Utc>) {
        let mut tx = store.begin(user).await.unwrap();
        tx.append_entry(entry(user, id, at)).await.unwrap();
        tx.upsert_account(account(user, id, at)).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin("u1").await.unwrap();
        tx.append_entry(entry("u1", "e1", now)).await.unwrap();
        tx.upsert_account(account("u1", "e1", now)).await.unwrap();
        assert_eq!(tx.query_entries(None, None).await.unwrap().len(), 1);
        drop(tx);

        assert!(store.query_entries("u1", None, None).await.unwrap().is_empty());
        assert!(store.get_account("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_requires_paired_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin("u1").await.unwrap();
        tx.append_entry(entry("u1", "e1", Utc::now())).await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransaction(_)));
        assert!(store.query_entries("u1", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_foreign_entry() {
        let store = MemoryStore::new();
        let mut tx = store.begin("u1").await.unwrap();
        assert!(tx.append_entry(entry("u2", "e1", Utc::now())).await.is_err());
    }

    #[tokio::test]
    async fn test_query_since_and_limit() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for i in 0..5 {
            write(&store, "u1", &format!("e{i}"), t0 + Duration::seconds(i)).await;
        }

        let recent = store
            .query_entries("u1", Some(t0 + Duration::seconds(2)), None)
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);

        let last_two = store.query_entries("u1", None, Some(2)).await.unwrap();
        let ids: Vec<_> = last_two.iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e4"]);
    }

    #[tokio::test]
    async fn test_delete_respects_boundary_and_limit() {
        let store = MemoryStore::new();
        let t0 = Utc::now() - Duration::days(200);
        for i in 0..6 {
            write(&store, "u1", &format!("e{i}"), t0 + Duration::days(i)).await;
        }

        let cutoff = t0 + Duration::days(100);
        let deleted = store
            .delete_entries_before("u1", "e4", cutoff, 3)
            .await
            .unwrap();
        assert_eq!(deleted, 3);

        let deleted = store
            .delete_entries_before("u1", "e4", cutoff, 3)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let left: Vec<_> = store
            .query_entries("u1", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.entry_id)
            .collect();
        assert_eq!(left, vec!["e4", "e5"]);
    }

    #[tokio::test]
    async fn test_same_account_transactions_serialize() {
        let store = Arc::new(MemoryStore::new());
        let tx = store.begin("u1").await.unwrap();

        let other = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            let _tx = other.begin("u1").await.unwrap();
        });

        // A different account is not blocked
        let _tx2 = store.begin("u2").await.unwrap();

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(tx);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_account_locks_are_pruned() {
        let store = MemoryStore::new();
        let held = store.begin("held").await.unwrap();

        for i in 0..500 {
            drop(store.begin(&format!("reader-{i}")).await.unwrap());
        }
        assert!(store.account_locks.lock().by_user.len() <= MIN_LOCK_PRUNE);

        // A lock in use survives pruning and still excludes
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), store.begin("held")).await;
        assert!(blocked.is_err());
        drop(held);
        store.begin("held").await.unwrap();
    }

    #[tokio::test]
    async fn test_reconciliation_records() {
        let store = MemoryStore::new();
        let result = ReconciliationResult {
            user_id: "u1".to_string(),
            expected_balance: 10,
            actual_balance: 12,
            difference: 2,
            is_balanced: false,
            expected: Balances::new(0, 0, 10),
            actual: Balances::new(0, 0, 12),
            last_entry_consistent: true,
            entries_replayed: 1,
            reconciled_at: Utc::now(),
        };

        store.record_reconciliation(&result).await.unwrap();
        assert_eq!(store.open_reconciliations(Some("u1")).await.unwrap().len(), 1);
        assert!(store.open_reconciliations(Some("u2")).await.unwrap().is_empty());

        assert_eq!(store.acknowledge_reconciliations("u1").await.unwrap(), 1);
        assert!(store.open_reconciliations(None).await.unwrap().is_empty());
    }
}
