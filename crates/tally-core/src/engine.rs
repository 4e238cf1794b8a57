//! Account Balance Engine: pure balance transitions.
//!
//! The engine applies fixed, non-configurable policy:
//! 1. `credit` only ever grows the monthly bucket
//! 2. `reset` restores free/welcome to plan defaults and sets monthly to the
//!    entry's token amount
//! 3. `debit` drains free actions, then welcome bonus, then monthly tokens
//!
//! The engine does NOT enforce sufficiency. A debit larger than the total
//! drives `monthly_tokens` negative; callers check [`BalanceEngine::can_afford`]
//! first. Reconciliation relies on [`BalanceEngine::fold`] being exactly the
//! stepwise application of [`BalanceEngine::apply`].

use crate::types::{to_signed, Action, Balances, LedgerEntry, PlanDefaults};

/// How a debit was split across the buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebitSplit {
    pub from_free: u64,
    pub from_welcome: u64,
    pub from_monthly: u64,
}

/// The balance engine.
#[derive(Debug, Clone, Default)]
pub struct BalanceEngine {
    plan: PlanDefaults,
}

impl BalanceEngine {
    pub fn new(plan: PlanDefaults) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &PlanDefaults {
        &self.plan
    }

    /// Balances an account starts from before its first ledger entry.
    pub fn opening_balances(&self) -> Balances {
        self.plan.opening_balances()
    }

    /// Apply a single transition.
    pub fn apply(&self, current: Balances, action: Action, tokens: u64) -> Balances {
        match action {
            Action::Credit => Balances {
                monthly_tokens: current.monthly_tokens.saturating_add(to_signed(tokens)),
                ..current
            },
            Action::Reset => Balances {
                free_actions: self.plan.free_actions,
                welcome_bonus: self.plan.welcome_bonus,
                monthly_tokens: to_signed(tokens),
            },
            Action::Debit => {
                let split = Self::debit_split(&current, tokens);
                Balances {
                    free_actions: current.free_actions - split.from_free,
                    welcome_bonus: current.welcome_bonus - split.from_welcome,
                    monthly_tokens: current
                        .monthly_tokens
                        .saturating_sub(to_signed(split.from_monthly)),
                }
            }
        }
    }

    /// Compute the bucket split for a debit without applying it.
    pub fn debit_split(current: &Balances, tokens: u64) -> DebitSplit {
        let mut remaining = tokens;

        let from_free = remaining.min(current.free_actions);
        remaining -= from_free;

        let from_welcome = remaining.min(current.welcome_bonus);
        remaining -= from_welcome;

        DebitSplit {
            from_free,
            from_welcome,
            from_monthly: remaining,
        }
    }

    /// Whether a debit of `tokens` is covered by the current total.
    pub fn can_afford(current: &Balances, tokens: u64) -> bool {
        current.total() >= to_signed(tokens)
    }

    /// Fold entries in apply order starting from `start`.
    pub fn fold<'a, I>(&self, start: Balances, entries: I) -> Balances
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        entries
            .into_iter()
            .fold(start, |acc, entry| self.apply(acc, entry.action, entry.tokens))
    }

    /// Replay a complete account history from the opening balances.
    pub fn replay<'a, I>(&self, entries: I) -> Balances
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        self.fold(self.opening_balances(), entries)
    }
}
