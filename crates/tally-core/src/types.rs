//! Ledger domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::metadata::Metadata;

/// Error returned when parsing an enum tag from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseTagError {
    pub kind: &'static str,
    pub value: String,
}

/// Kind of value transfer recorded by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Credit,
    Debit,
    Reset,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Credit => "credit",
            Action::Debit => "debit",
            Action::Reset => "reset",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Action::Credit),
            "debit" => Ok(Action::Debit),
            "reset" => Ok(Action::Reset),
            other => Err(ParseTagError {
                kind: "action",
                value: other.to_string(),
            }),
        }
    }
}

/// Subsystem that requested a ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Cheap preview of an external resource (e.g. video metadata)
    Preview,
    /// Full ingest of an external resource
    Ingest,
    /// AI content generation
    Generation,
    /// Verified store purchase
    Purchase,
    /// Subscription grant
    Subscription,
    /// Billing-cycle rollover
    Rollover,
    /// Operator adjustment
    Admin,
}

impl Source {
    pub const ALL: [Source; 7] = [
        Source::Preview,
        Source::Ingest,
        Source::Generation,
        Source::Purchase,
        Source::Subscription,
        Source::Rollover,
        Source::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Preview => "preview",
            Source::Ingest => "ingest",
            Source::Generation => "generation",
            Source::Purchase => "purchase",
            Source::Subscription => "subscription",
            Source::Rollover => "rollover",
            Source::Admin => "admin",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| ParseTagError {
                kind: "source",
                value: s.to_string(),
            })
    }
}

/// The three sub-balances of an account.
///
/// `free_actions` and `welcome_bonus` can never go negative. `monthly_tokens`
/// is signed because a debit that skipped the sufficiency check lands its
/// remainder there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub free_actions: u64,
    pub welcome_bonus: u64,
    pub monthly_tokens: i64,
}

impl Balances {
    pub const ZERO: Balances = Balances {
        free_actions: 0,
        welcome_bonus: 0,
        monthly_tokens: 0,
    };

    pub fn new(free_actions: u64, welcome_bonus: u64, monthly_tokens: i64) -> Self {
        Self {
            free_actions,
            welcome_bonus,
            monthly_tokens,
        }
    }

    /// Total available tokens across all buckets.
    pub fn total(&self) -> i64 {
        to_signed(self.free_actions)
            .saturating_add(to_signed(self.welcome_bonus))
            .saturating_add(self.monthly_tokens)
    }
}

impl fmt::Display for Balances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free={} welcome={} monthly={}",
            self.free_actions, self.welcome_bonus, self.monthly_tokens
        )
    }
}

/// Opening balances for a newly created account, also restored on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanDefaults {
    pub free_actions: u64,
    pub welcome_bonus: u64,
    pub monthly_tokens: u64,
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            free_actions: 20,
            welcome_bonus: 20,
            monthly_tokens: 0,
        }
    }
}

impl PlanDefaults {
    pub fn opening_balances(&self) -> Balances {
        Balances::new(
            self.free_actions,
            self.welcome_bonus,
            to_signed(self.monthly_tokens),
        )
    }
}

/// Balance projection for a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,

    #[serde(flatten)]
    pub balances: Balances,

    /// Most recently applied ledger entry (audit back-reference)
    pub last_ledger_entry_id: Option<String>,

    pub last_updated: DateTime<Utc>,
}

impl Account {
    /// Synthesize an account with the plan's opening balances.
    pub fn open(user_id: impl Into<String>, plan: &PlanDefaults, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            balances: plan.opening_balances(),
            last_ledger_entry_id: None,
            last_updated: now,
        }
    }

    pub fn total_available_tokens(&self) -> i64 {
        self.balances.total()
    }
}

/// Immutable record of one accepted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub user_id: String,
    pub action: Action,
    pub tokens: u64,

    /// Caller-supplied idempotency key
    pub request_id: String,

    pub timestamp: DateTime<Utc>,
    pub source: Source,

    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Outcome of replaying one account's ledger against its projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub user_id: String,
    pub expected_balance: i64,
    pub actual_balance: i64,
    pub difference: u64,
    pub is_balanced: bool,

    /// Bucket breakdown derived from the ledger
    pub expected: Balances,

    /// Bucket breakdown read from the projection
    pub actual: Balances,

    /// Whether the projection points at the last replayed entry
    pub last_entry_consistent: bool,

    pub entries_replayed: usize,
    pub reconciled_at: DateTime<Utc>,
}

pub(crate) fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip_text() {
        for action in [Action::Credit, Action::Debit, Action::Reset] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("refund".parse::<Action>().is_err());
    }

    #[test]
    fn test_source_parse_unknown() {
        let err = "scraper".parse::<Source>().unwrap_err();
        assert_eq!(err.kind, "source");
        assert_eq!("rollover".parse::<Source>().unwrap(), Source::Rollover);
    }

    #[test]
    fn test_balances_total_includes_negative_monthly() {
        let balances = Balances::new(2, 3, -4);
        assert_eq!(balances.total(), 1);
    }

    #[test]
    fn test_account_serializes_flat_buckets() {
        let account = Account::open("u1", &PlanDefaults::default(), Utc::now());
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["free_actions"], 20);
        assert_eq!(json["welcome_bonus"], 20);
        assert_eq!(json["monthly_tokens"], 0);
        assert_eq!(account.total_available_tokens(), 40);
    }
}
