//! Concurrency strategy and retry budget of a registered handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How queue entries sharing a mutex key are resolved at selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyStrategy {
    /// No coordination; every enqueue is independent.
    #[default]
    Any,
    /// The earliest entry wins, later siblings are cancelled.
    First,
    /// The most recent entry wins, earlier siblings are cancelled.
    Last,
    /// One entry per key at a time, siblings are held BLOCKED until it finishes.
    Unique,
}

impl ConcurrencyStrategy {
    /// Strategies that guarantee at most one in-flight task per mutex key.
    pub fn is_coordinated(self) -> bool {
        !matches!(self, ConcurrencyStrategy::Any)
    }
}

impl fmt::Display for ConcurrencyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcurrencyStrategy::Any => "ANY",
            ConcurrencyStrategy::First => "FIRST",
            ConcurrencyStrategy::Last => "LAST",
            ConcurrencyStrategy::Unique => "UNIQUE",
        };
        f.write_str(s)
    }
}

/// How many times a failing task is put back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryBudget {
    Limited(u32),
    /// Retries forever. A poison-pill task loops until cancelled or until the
    /// configured retry ceiling stops it.
    Unlimited,
}

impl RetryBudget {
    /// Whether an entry that has already been retried `retries` times may be
    /// retried once more.
    pub fn allows(self, retries: u32) -> bool {
        match self {
            RetryBudget::Limited(limit) => retries < limit,
            RetryBudget::Unlimited => true,
        }
    }

    /// Applies a hard ceiling on top of the nominal budget.
    pub fn capped(self, ceiling: Option<u32>) -> Self {
        match (self, ceiling) {
            (RetryBudget::Unlimited, Some(ceiling)) => RetryBudget::Limited(ceiling),
            (RetryBudget::Limited(limit), Some(ceiling)) => RetryBudget::Limited(limit.min(ceiling)),
            (budget, None) => budget,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Limited(0)
    }
}

/// Negative values are the "unlimited" sentinel.
impl From<i32> for RetryBudget {
    fn from(value: i32) -> Self {
        u32::try_from(value).map_or(RetryBudget::Unlimited, RetryBudget::Limited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(-1, RetryBudget::Unlimited)]
    #[case(-42, RetryBudget::Unlimited)]
    #[case(0, RetryBudget::Limited(0))]
    #[case(3, RetryBudget::Limited(3))]
    fn signed_sentinel_conversion(#[case] raw: i32, #[case] expected: RetryBudget) {
        assert_eq!(RetryBudget::from(raw), expected);
    }

    #[rstest]
    #[case(RetryBudget::Limited(2), 0, true)]
    #[case(RetryBudget::Limited(2), 1, true)]
    #[case(RetryBudget::Limited(2), 2, false)]
    #[case(RetryBudget::Limited(0), 0, false)]
    #[case(RetryBudget::Unlimited, 10_000, true)]
    fn budget_allows(#[case] budget: RetryBudget, #[case] retries: u32, #[case] expected: bool) {
        assert_eq!(budget.allows(retries), expected);
    }

    #[test]
    fn ceiling_caps_unlimited_and_limited() {
        assert_eq!(RetryBudget::Unlimited.capped(Some(5)), RetryBudget::Limited(5));
        assert_eq!(RetryBudget::Limited(9).capped(Some(5)), RetryBudget::Limited(5));
        assert_eq!(RetryBudget::Limited(2).capped(Some(5)), RetryBudget::Limited(2));
        assert_eq!(RetryBudget::Unlimited.capped(None), RetryBudget::Unlimited);
    }

    #[test]
    fn only_any_is_uncoordinated() {
        assert!(!ConcurrencyStrategy::Any.is_coordinated());
        assert!(ConcurrencyStrategy::First.is_coordinated());
        assert!(ConcurrencyStrategy::Last.is_coordinated());
        assert!(ConcurrencyStrategy::Unique.is_coordinated());
    }
}
