//! Ledger store abstractions.
//!
//! A store persists two things per account: the append-only entry log and
//! the current balance projection. Every mutation goes through a
//! [`StoreTransaction`] scoped to one account, which is serializable with
//! respect to other transactions on that account and all-or-nothing:
//! nothing is visible until `commit`, and dropping an uncommitted
//! transaction discards it.
//!
//! Entries are always returned in append order, which is the order the
//! balance engine applies them in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{Account, LedgerEntry, ReconciliationResult};

use crate::error::StoreError;

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A persisted reconciliation mismatch awaiting operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: i64,
    pub result: ReconciliationResult,
    pub acknowledged: bool,
}

/// Store abstraction allows swapping persistence backends.
///
/// # Atomicity Contract
/// Implementations MUST guarantee that an entry appended through a
/// transaction and the account upserted through the same transaction
/// become visible together or not at all.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction scoped to one account. Waits for any other
    /// transaction on the same account to finish.
    async fn begin(&self, user_id: &str) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Committed entries for an account with `timestamp >= since`, in
    /// append order. With a limit, only the most recent `limit` entries.
    async fn query_entries(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StoreError>;

    /// Ids of every account with a projection or at least one entry.
    async fn list_accounts(&self) -> Result<Vec<String>, StoreError>;

    /// Delete up to `limit` of the oldest entries that were appended
    /// before `boundary_entry_id` and are older than `older_than`.
    async fn delete_entries_before(
        &self,
        user_id: &str,
        boundary_entry_id: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;

    async fn record_reconciliation(&self, result: &ReconciliationResult) -> Result<i64, StoreError>;

    /// Unacknowledged mismatch records, optionally for one account.
    async fn open_reconciliations(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReconciliationRecord>, StoreError>;

    /// Mark all open records for an account as reviewed.
    async fn acknowledge_reconciliations(&self, user_id: &str) -> Result<usize, StoreError>;
}

/// One account's read-modify-write unit.
#[async_trait]
pub trait StoreTransaction: Send {
    fn user_id(&self) -> &str;

    /// Entries visible to this transaction (committed plus its own
    /// appends), same ordering and limit rules as
    /// [`LedgerStore::query_entries`].
    async fn query_entries(
        &mut self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn get_account(&mut self) -> Result<Option<Account>, StoreError>;

    async fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError>;

    async fn upsert_account(&mut self, account: Account) -> Result<(), StoreError>;

    /// Make all writes visible. Fails if an entry was appended without an
    /// account update or vice versa.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Shared write validation for transaction implementations.
pub(crate) fn check_entry_owner(user_id: &str, entry: &LedgerEntry) -> Result<(), StoreError> {
    if entry.user_id != user_id {
        return Err(StoreError::InvalidTransaction(format!(
            "entry {} belongs to '{}', transaction is scoped to '{}'",
            entry.entry_id, entry.user_id, user_id
        )));
    }
    Ok(())
}

pub(crate) fn check_account_owner(user_id: &str, account: &Account) -> Result<(), StoreError> {
    if account.user_id != user_id {
        return Err(StoreError::InvalidTransaction(format!(
            "account '{}' written in transaction scoped to '{}'",
            account.user_id, user_id
        )));
    }
    Ok(())
}

pub(crate) fn check_paired_writes(appended: usize, upserted: bool) -> Result<(), StoreError> {
    if (appended > 0) != upserted {
        return Err(StoreError::InvalidTransaction(
            "ledger entry and account projection must be written together".to_string(),
        ));
    }
    Ok(())
}

/// Apply `since`/`limit` to entries already in append order.
pub(crate) fn window_entries(
    entries: impl Iterator<Item = LedgerEntry>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
) -> Vec<LedgerEntry> {
    let mut selected: Vec<LedgerEntry> = entries
        .filter(|e| since.map_or(true, |s| e.timestamp >= s))
        .collect();
    if let Some(limit) = limit {
        let excess = selected.len().saturating_sub(limit);
        selected.drain(..excess);
    }
    selected
}
