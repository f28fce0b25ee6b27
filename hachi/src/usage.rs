//! Token usage tracking for LLM operations.
//!
//! Usage counters are additive: the runner sums per-turn usage into a
//! run-level total, and racing or nested runs can fold their totals
//! together with `+`.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage statistics from an LLM operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input/prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u32,

    /// Number of tokens in the output/completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u32,

    /// Total tokens used (input + output).
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Returns `true` if no tokens were recorded.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_computes_total() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.total_tokens, 150);
        assert!(!usage.is_zero());
    }

    #[test]
    fn zero_is_zero() {
        assert!(Usage::zero().is_zero());
    }

    #[test]
    fn add_assign_accumulates() {
        let mut total = Usage::zero();
        total += Usage::new(10, 5);
        total += Usage::new(20, 10);
        assert_eq!(total, Usage::new(30, 15));
    }

    #[test]
    fn sum_over_iterator() {
        let total: Usage = [Usage::new(1, 1), Usage::new(2, 2), Usage::new(3, 3)]
            .into_iter()
            .sum();
        assert_eq!(total.total_tokens, 12);
    }

    #[test]
    fn serde_accepts_openai_aliases() {
        let usage: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}"#)
                .expect("deserialize");
        assert_eq!(usage, Usage::new(7, 3));
    }
}
