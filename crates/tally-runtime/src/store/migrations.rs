use rusqlite::Connection;

use crate::error::StoreError;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                tokens INTEGER NOT NULL CHECK (tokens >= 0),
                request_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_entries_user_seq ON ledger_entries(user_id, seq);
            CREATE INDEX IF NOT EXISTS idx_entries_user_ts ON ledger_entries(user_id, timestamp);

            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                free_actions INTEGER NOT NULL,
                welcome_bonus INTEGER NOT NULL,
                monthly_tokens INTEGER NOT NULL,
                last_ledger_entry_id TEXT,
                last_updated TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS reconciliations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                is_balanced INTEGER NOT NULL,
                acknowledged INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                reconciled_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reconciliations_open
                ON reconciliations(user_id, acknowledged);
        "#,
    },
];

/// Latest schema version known to this build.
pub(crate) fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

pub(crate) fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current = current_version(conn)?;
    if current > latest_version() {
        return Err(StoreError::Corrupt(format!(
            "database schema v{current} is newer than this build (v{})",
            latest_version()
        )));
    }

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::info!("Running ledger migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .unwrap();
        assert!(matches!(run_migrations(&conn), Err(StoreError::Corrupt(_))));
    }
}
