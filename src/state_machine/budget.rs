use serde::{Deserialize, Serialize};

/// Turn and token allowance for one job.
///
/// Usage may exceed the limits; that is the trigger for the confirmation
/// gate, not an invalid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limit_turns: u64,
    pub limit_tokens: u64,
    pub used_turns: u64,
    pub used_tokens: u64,
    /// Turns added to `limit_turns` per confirmation.
    pub extension_turns: u64,
    /// Tokens added to `limit_tokens` per confirmation.
    pub extension_tokens: u64,
    /// Number of confirmations granted so far.
    pub extensions_granted: u32,
}

impl Budget {
    pub fn new(
        limit_turns: u64,
        limit_tokens: u64,
        extension_turns: u64,
        extension_tokens: u64,
    ) -> Self {
        Self {
            limit_turns,
            limit_tokens,
            used_turns: 0,
            used_tokens: 0,
            extension_turns,
            extension_tokens,
            extensions_granted: 0,
        }
    }
}

/// Decides whether accumulated usage requires a human confirmation.
pub struct BudgetGovernor;

impl BudgetGovernor {
    pub fn is_exhausted(budget: &Budget) -> bool {
        budget.used_turns > budget.limit_turns || budget.used_tokens > budget.limit_tokens
    }

    /// Adds consumed turns/tokens. Usage never decreases.
    pub fn record_usage(budget: &mut Budget, turns: u64, tokens: u64) {
        budget.used_turns = budget.used_turns.saturating_add(turns);
        budget.used_tokens = budget.used_tokens.saturating_add(tokens);
    }

    /// Returns the budget with one extension added to the limits.
    ///
    /// Usage is carried over untouched so the lifetime meter stays accurate.
    pub fn grant_extension(budget: &Budget) -> Budget {
        Budget {
            limit_turns: budget.limit_turns.saturating_add(budget.extension_turns),
            limit_tokens: budget.limit_tokens.saturating_add(budget.extension_tokens),
            extensions_granted: budget.extensions_granted + 1,
            ..*budget
        }
    }
}
