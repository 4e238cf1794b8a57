//! # tally-core
//!
//! Deterministic model of the tally token ledger.
//!
//! This crate holds the pieces of the ledger that have no I/O:
//! - Accounts with three balance buckets (free actions, welcome bonus,
//!   monthly tokens)
//! - Immutable ledger entries and their audit metadata
//! - The balance engine that turns an entry sequence into balances
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same entries always fold to the same balances
//! 2. **Ordered consumption**: Debits drain free, then welcome, then monthly
//! 3. **Replayable**: A live projection can always be checked against its ledger
//!
//! ## Example
//!
//! ```rust
//! use tally_core::{Action, BalanceEngine, Balances};
//!
//! let engine = BalanceEngine::default();
//! let after = engine.apply(Balances::new(5, 3, 10), Action::Debit, 6);
//! assert_eq!(after, Balances::new(0, 2, 10));
//! ```

pub mod engine;
pub mod metadata;
pub mod types;

pub use engine::{BalanceEngine, DebitSplit};
pub use metadata::{MetaValue, Metadata};
pub use types::{
    Account, Action, Balances, LedgerEntry, ParseTagError, PlanDefaults, ReconciliationResult,
    Source,
};
