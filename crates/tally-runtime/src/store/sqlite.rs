//! SQLite-backed ledger store.
//!
//! One connection guarded by an async mutex. A transaction holds the lock
//! from `BEGIN IMMEDIATE` until commit or drop, so writes are serialized
//! store-wide; that is stricter than the per-account guarantee the trait
//! asks for.
//!
//! Every rusqlite call runs on the blocking pool. A caller that stops
//! waiting (a write timeout) is released immediately; the connection comes
//! back to the store once the in-flight statement returns, and an
//! unfinished transaction is rolled back at that point.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{Account, Balances, LedgerEntry, Metadata, ReconciliationResult};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    check_account_owner, check_entry_owner, check_paired_writes, migrations, LedgerStore,
    ReconciliationRecord, StoreTransaction,
};
use crate::config::CoordinatorConfig;
use crate::error::StoreError;

const ENTRY_COLUMNS: &str =
    "entry_id, user_id, action, tokens, request_id, timestamp, source, metadata";

/// Durable store on a single SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<AsyncMutex<Connection>>,
}

impl SqliteStore {
    /// Open with a lock wait matching the default write timeout.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_busy_timeout(path, CoordinatorConfig::default().write_timeout)
    }

    /// Open, waiting at most `busy_timeout` for another connection's lock.
    ///
    /// Pass the coordinator's `write_timeout` so a blocked statement gives
    /// up about when the coordinator stops waiting for it.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrations::run_migrations(&conn)?;
        tracing::debug!(path = %path.display(), ?busy_timeout, "Opened ledger database");
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&conn)).await?
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn begin(&self, user_id: &str) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let owner = user_id.to_string();
        let tx = tokio::task::spawn_blocking(move || -> Result<TxConn, StoreError> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(TxConn {
                conn,
                user_id: owner,
                open: true,
            })
        })
        .await??;

        Ok(Box::new(SqliteTransaction {
            user_id: user_id.to_string(),
            tx: Some(tx),
            appended: 0,
            upserted: false,
        }))
    }

    async fn query_entries(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| select_entries(conn, &user_id, since, limit))
            .await
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| select_account(conn, &user_id)).await
    }

    async fn list_accounts(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM accounts
                 UNION
                 SELECT DISTINCT user_id FROM ledger_entries
                 ORDER BY 1",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn delete_entries_before(
        &self,
        user_id: &str,
        boundary_entry_id: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let user_id = user_id.to_string();
        let boundary_entry_id = boundary_entry_id.to_string();
        let limit = to_sql_int(limit as u64)?;

        self.with_conn(move |conn| {
            let boundary: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM ledger_entries WHERE user_id = ?1 AND entry_id = ?2",
                    params![user_id, boundary_entry_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(boundary) = boundary else {
                return Err(StoreError::InvalidTransaction(format!(
                    "boundary entry {boundary_entry_id} not found for '{user_id}'"
                )));
            };

            let deleted = conn.execute(
                "DELETE FROM ledger_entries WHERE seq IN (
                    SELECT seq FROM ledger_entries
                    WHERE user_id = ?1 AND seq < ?2 AND timestamp < ?3
                    ORDER BY seq
                    LIMIT ?4
                 )",
                params![user_id, boundary, encode_time(older_than), limit],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn record_reconciliation(&self, result: &ReconciliationResult) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(result)?;
        let user_id = result.user_id.clone();
        let is_balanced = result.is_balanced;
        let reconciled_at = encode_time(result.reconciled_at);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO reconciliations (user_id, is_balanced, payload, reconciled_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, is_balanced, payload, reconciled_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn open_reconciliations(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReconciliationRecord>, StoreError> {
        let user_id = user_id.map(str::to_string);
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, payload, acknowledged FROM reconciliations
                     WHERE acknowledged = 0 AND (?1 IS NULL OR user_id = ?1)
                     ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![user_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, bool>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, payload, acknowledged)| -> Result<_, StoreError> {
                Ok(ReconciliationRecord {
                    id,
                    result: serde_json::from_str(&payload)?,
                    acknowledged,
                })
            })
            .collect()
    }

    async fn acknowledge_reconciliations(&self, user_id: &str) -> Result<usize, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE reconciliations SET acknowledged = 1 WHERE user_id = ?1 AND acknowledged = 0",
                [user_id],
            )?;
            Ok(updated)
        })
        .await
    }
}

/// The locked connection while a transaction is open on it.
///
/// Rolls back on drop unless committed, wherever the drop happens: in the
/// transaction, or on the blocking pool after its caller gave up.
struct TxConn {
    conn: OwnedMutexGuard<Connection>,
    user_id: String,
    open: bool,
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(user_id = %self.user_id, error = %e, "Rollback failed");
        }
    }
}

struct SqliteTransaction {
    user_id: String,
    /// Out on the blocking pool while a statement runs
    tx: Option<TxConn>,
    appended: usize,
    upserted: bool,
}

impl SqliteTransaction {
    async fn run<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut TxConn) -> Result<T, StoreError> + Send + 'static,
    {
        let mut tx = self.tx.take().ok_or_else(|| {
            StoreError::InvalidTransaction("transaction was interrupted".to_string())
        })?;
        let (tx, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut tx);
            (tx, result)
        })
        .await?;
        self.tx = Some(tx);
        result
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn query_entries(
        &mut self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.run(move |tx| select_entries(&tx.conn, &tx.user_id, since, limit))
            .await
    }

    async fn get_account(&mut self) -> Result<Option<Account>, StoreError> {
        self.run(|tx| select_account(&tx.conn, &tx.user_id)).await
    }

    async fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        check_entry_owner(&self.user_id, &entry)?;
        let tokens = to_sql_int(entry.tokens)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        self.run(move |tx| {
            tx.conn.execute(
                &format!("INSERT INTO ledger_entries ({ENTRY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    entry.entry_id,
                    entry.user_id,
                    entry.action.as_str(),
                    tokens,
                    entry.request_id,
                    encode_time(entry.timestamp),
                    entry.source.as_str(),
                    metadata,
                ],
            )?;
            Ok(())
        })
        .await?;
        self.appended += 1;
        Ok(())
    }

    async fn upsert_account(&mut self, account: Account) -> Result<(), StoreError> {
        check_account_owner(&self.user_id, &account)?;
        let free = to_sql_int(account.balances.free_actions)?;
        let welcome = to_sql_int(account.balances.welcome_bonus)?;
        self.run(move |tx| {
            tx.conn.execute(
                "INSERT INTO accounts
                    (user_id, free_actions, welcome_bonus, monthly_tokens, last_ledger_entry_id, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                    free_actions = excluded.free_actions,
                    welcome_bonus = excluded.welcome_bonus,
                    monthly_tokens = excluded.monthly_tokens,
                    last_ledger_entry_id = excluded.last_ledger_entry_id,
                    last_updated = excluded.last_updated",
                params![
                    account.user_id,
                    free,
                    welcome,
                    account.balances.monthly_tokens,
                    account.last_ledger_entry_id,
                    encode_time(account.last_updated),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.upserted = true;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        check_paired_writes(this.appended, this.upserted)?;
        this.run(|tx| {
            tx.conn.execute_batch("COMMIT")?;
            tx.open = false;
            Ok(())
        })
        .await
    }
}

fn select_entries(
    conn: &Connection,
    user_id: &str,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
) -> Result<Vec<LedgerEntry>, StoreError> {
    // LIMIT -1 is unbounded in SQLite
    let limit = match limit {
        Some(n) => to_sql_int(n as u64)?,
        None => -1,
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM (
            SELECT seq, {ENTRY_COLUMNS} FROM ledger_entries
            WHERE user_id = ?1 AND (?2 IS NULL OR timestamp >= ?2)
            ORDER BY seq DESC
            LIMIT ?3
         ) ORDER BY seq ASC"
    ))?;
    let rows = stmt
        .query_map(params![user_id, since.map(encode_time), limit], |row| {
            Ok(EntryRow {
                entry_id: row.get(0)?,
                user_id: row.get(1)?,
                action: row.get(2)?,
                tokens: row.get(3)?,
                request_id: row.get(4)?,
                timestamp: row.get(5)?,
                source: row.get(6)?,
                metadata: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(EntryRow::decode).collect()
}

fn select_account(conn: &Connection, user_id: &str) -> Result<Option<Account>, StoreError> {
    let row = conn
        .query_row(
            "SELECT free_actions, welcome_bonus, monthly_tokens, last_ledger_entry_id, last_updated
             FROM accounts WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((free, welcome, monthly, last_entry, updated)) = row else {
        return Ok(None);
    };
    Ok(Some(Account {
        user_id: user_id.to_string(),
        balances: Balances::new(from_sql_int(free)?, from_sql_int(welcome)?, monthly),
        last_ledger_entry_id: last_entry,
        last_updated: decode_time(&updated)?,
    }))
}

/// Raw column values, decoded outside the rusqlite row callback.
struct EntryRow {
    entry_id: String,
    user_id: String,
    action: String,
    tokens: i64,
    request_id: String,
    timestamp: String,
    source: String,
    metadata: String,
}

impl EntryRow {
    fn decode(self) -> Result<LedgerEntry, StoreError> {
        let corrupt = |e: tally_core::ParseTagError| {
            StoreError::Corrupt(format!("entry {}: {e}", self.entry_id))
        };
        let action = self.action.parse().map_err(corrupt)?;
        let source = self.source.parse().map_err(corrupt)?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        Ok(LedgerEntry {
            tokens: from_sql_int(self.tokens)?,
            timestamp: decode_time(&self.timestamp)?,
            entry_id: self.entry_id,
            user_id: self.user_id,
            action,
            request_id: self.request_id,
            source,
            metadata,
        })
    }
}

/// Fixed-width RFC 3339 so lexical order matches time order.
fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{text}': {e}")))
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("value {value} exceeds SQLite integer range")))
}

fn from_sql_int(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {value}")))
}
