//! `tally`: operator CLI over a SQLite-backed ledger.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tally_core::{Action, MetaValue, Source};
use tally_runtime::{LedgerConfig, LedgerError, LedgerRuntime, SqliteStore, TransactionRequest};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Token ledger administration"
)]
struct Cli {
    /// Ledger database file
    #[arg(long, global = true, default_value = "tally.db")]
    db: PathBuf,

    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a ledger transaction
    Apply {
        #[arg(long)]
        user: String,
        /// credit, debit or reset
        #[arg(long)]
        action: Action,
        #[arg(long)]
        tokens: u64,
        /// Idempotency key
        #[arg(long)]
        request_id: String,
        /// Subsystem tag (preview, ingest, purchase, ...)
        #[arg(long, default_value = "admin")]
        source: Source,
        /// Audit metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, MetaValue)>,
    },
    /// Show an account's balances
    Balance {
        #[arg(long)]
        user: String,
    },
    /// List an account's most recent ledger entries
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Replay ledgers and compare with account projections
    Reconcile {
        /// Only this account; all accounts when omitted
        #[arg(long)]
        user: Option<String>,
    },
    /// Delete entries past the retention window
    Cleanup,
    /// List unacknowledged reconciliation mismatches
    Mismatches {
        #[arg(long)]
        user: Option<String>,
    },
    /// Acknowledge a user's reconciliation mismatches
    Ack {
        #[arg(long)]
        user: String,
    },
    /// Print the effective configuration as YAML
    Config,
}

/// Parse `key=value`, typing integers and booleans.
fn parse_meta(raw: &str) -> Result<(String, MetaValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("metadata key must not be empty".to_string());
    }

    let value = if let Ok(i) = value.parse::<i64>() {
        MetaValue::Int(i)
    } else if let Ok(b) = value.parse::<bool>() {
        MetaValue::Bool(b)
    } else {
        MetaValue::Str(value.to_string())
    };
    Ok((key.to_string(), value))
}

#[derive(Serialize)]
struct Rejection<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_id: Option<&'a str>,
}

impl<'a> From<&'a LedgerError> for Rejection<'a> {
    fn from(e: &'a LedgerError) -> Self {
        Self {
            error: e.kind(),
            message: e.to_string(),
            retry_after_ms: e.retry_after().map(|d| d.as_millis()),
            entry_id: match e {
                LedgerError::DuplicateRequest { entry_id, .. } => Some(entry_id.as_str()),
                _ => None,
            },
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LedgerConfig> {
    match path {
        Some(path) => LedgerConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(LedgerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let effective = config.clone();
    let db = cli.db;
    let open = move || -> anyhow::Result<LedgerRuntime> {
        tracing::debug!(db = %db.display(), "Opening ledger");
        let store = SqliteStore::open_with_busy_timeout(&db, config.coordinator.write_timeout)
            .with_context(|| format!("opening ledger database {}", db.display()))?;
        Ok(LedgerRuntime::builder()
            .store(Arc::new(store))
            .config(config)
            .build()?)
    };

    match cli.command {
        Commands::Apply {
            user,
            action,
            tokens,
            request_id,
            source,
            meta,
        } => {
            let runtime = open()?;
            let mut request = TransactionRequest::new(user, action, tokens, request_id, source);
            for (key, value) in meta {
                request = request.with_metadata(key, value);
            }

            match runtime.coordinator.apply_transaction(request).await {
                Ok(entry) => print_json(&entry)?,
                Err(e) => {
                    print_json(&Rejection::from(&e))?;
                    // A duplicate is an already-applied success
                    if !matches!(e, LedgerError::DuplicateRequest { .. }) {
                        return Ok(ExitCode::from(2));
                    }
                }
            }
        }
        Commands::Balance { user } => {
            let runtime = open()?;
            let account = runtime.coordinator.balance(&user).await?;
            print_json(&serde_json::json!({
                "account": account,
                "total_available_tokens": account.total_available_tokens(),
            }))?;
        }
        Commands::History { user, limit } => {
            let runtime = open()?;
            let entries = runtime.coordinator.history(&user, Some(limit)).await?;
            print_json(&entries)?;
        }
        Commands::Reconcile { user: Some(user) } => {
            let runtime = open()?;
            let result = runtime.auditor.reconcile(&user).await?;
            print_json(&result)?;
            if !result.is_balanced {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Reconcile { user: None } => {
            let runtime = open()?;
            let report = runtime.admin.reconcile_all().await?;
            print_json(&report)?;
            if !report.is_clean() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Cleanup => {
            let runtime = open()?;
            let report = runtime.admin.cleanup_retention().await?;
            print_json(&report)?;
        }
        Commands::Mismatches { user } => {
            let runtime = open()?;
            let records = runtime.admin.open_mismatches(user.as_deref()).await?;
            print_json(&records)?;
        }
        Commands::Ack { user } => {
            let runtime = open()?;
            let acknowledged = runtime.admin.acknowledge_mismatches(&user).await?;
            print_json(&serde_json::json!({ "user_id": user, "acknowledged": acknowledged }))?;
        }
        Commands::Config => print!("{}", effective.to_yaml()?),
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_types_values() {
        assert_eq!(
            parse_meta("resource_id=vid-9").unwrap(),
            ("resource_id".to_string(), MetaValue::Str("vid-9".to_string()))
        );
        assert_eq!(parse_meta("attempt=3").unwrap().1, MetaValue::Int(3));
        assert_eq!(parse_meta("manual=true").unwrap().1, MetaValue::Bool(true));
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::try_parse_from([
            "tally",
            "--db",
            "/tmp/ledger.db",
            "apply",
            "--user",
            "u1",
            "--action",
            "debit",
            "--tokens",
            "5",
            "--request-id",
            "r1",
            "--source",
            "preview",
            "--meta",
            "resource_id=vid-1",
        ])
        .unwrap();

        match cli.command {
            Commands::Apply {
                action, source, meta, ..
            } => {
                assert_eq!(action, Action::Debit);
                assert_eq!(source, Source::Preview);
                assert_eq!(meta.len(), 1);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_rejection_carries_duplicate_entry() {
        let err = LedgerError::DuplicateRequest {
            request_id: "r1".to_string(),
            entry_id: "e1".to_string(),
        };
        let json = serde_json::to_value(Rejection::from(&err)).unwrap();
        assert_eq!(json["error"], "duplicate_request");
        assert_eq!(json["entry_id"], "e1");
    }
}
