//! Retry strategies for failed tasks.
//!
//! The textual grammar (`none`, `pow<N>`, `<N>m`, `<N>h`, `<N>d`, case-insensitive,
//! `N` a positive integer) is parsed once when a task is scheduled. The store
//! keeps the canonical text form; everything else works with the enum.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Unit of a fixed retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    fn suffix(self) -> char {
        match self {
            DelayUnit::Minutes => 'm',
            DelayUnit::Hours => 'h',
            DelayUnit::Days => 'd',
        }
    }

    fn minutes(self) -> u64 {
        match self {
            DelayUnit::Minutes => 1,
            DelayUnit::Hours => 60,
            DelayUnit::Days => 24 * 60,
        }
    }
}

/// A constant delay, independent of how many times the task has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedDelay {
    pub amount: u32,
    pub unit: DelayUnit,
}

impl FixedDelay {
    pub fn minutes(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Minutes,
        }
    }

    pub fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Hours,
        }
    }

    pub fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Days,
        }
    }

    pub fn as_duration(&self) -> Duration {
        minutes_to_duration(u64::from(self.amount).saturating_mul(self.unit.minutes()))
    }
}

/// How a failed task is rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RetryStrategy {
    /// Never retried; a failed task is parked until rescheduled by an operator.
    None,
    /// Delay of `retries^N` minutes.
    Power(u32),
    /// Constant delay.
    Fixed(FixedDelay),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Power(1)
    }
}

impl RetryStrategy {
    /// Delay before the next attempt, given the failure count *after* the
    /// failed attempt was recorded.
    ///
    /// Returns `None` for [`RetryStrategy::None`].
    pub fn backoff(&self, retries: u32) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Power(exp) => {
                let minutes = u64::from(retries)
                    .checked_pow(*exp)
                    .unwrap_or(u64::MAX);
                Some(minutes_to_duration(minutes))
            }
            RetryStrategy::Fixed(delay) => Some(delay.as_duration()),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RetryStrategy::None)
    }
}

fn minutes_to_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn parse_positive(digits: &str, raw: &str) -> Result<u32, DomainError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DomainError::invalid_retry_strategy(raw));
    }
    match digits.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DomainError::invalid_retry_strategy(raw)),
    }
}

impl FromStr for RetryStrategy {
    type Err = DomainError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.to_ascii_lowercase();

        if lower == "none" {
            return Ok(RetryStrategy::None);
        }

        if let Some(digits) = lower.strip_prefix("pow") {
            return parse_positive(digits, raw).map(RetryStrategy::Power);
        }

        let unit = match lower.chars().last() {
            Some('m') => DelayUnit::Minutes,
            Some('h') => DelayUnit::Hours,
            Some('d') => DelayUnit::Days,
            _ => return Err(DomainError::invalid_retry_strategy(raw)),
        };
        let amount = parse_positive(&lower[..lower.len() - 1], raw)?;

        Ok(RetryStrategy::Fixed(FixedDelay { amount, unit }))
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::None => f.write_str("none"),
            RetryStrategy::Power(exp) => write!(f, "pow{exp}"),
            RetryStrategy::Fixed(delay) => write!(f, "{}{}", delay.amount, delay.unit.suffix()),
        }
    }
}

impl TryFrom<String> for RetryStrategy {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RetryStrategy> for String {
    fn from(value: RetryStrategy) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_every_form_of_the_grammar() {
        assert_eq!("none".parse::<RetryStrategy>().unwrap(), RetryStrategy::None);
        assert_eq!("pow2".parse::<RetryStrategy>().unwrap(), RetryStrategy::Power(2));
        assert_eq!("POW3".parse::<RetryStrategy>().unwrap(), RetryStrategy::Power(3));
        assert_eq!(
            "5m".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Fixed(FixedDelay::minutes(5))
        );
        assert_eq!(
            "12h".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Fixed(FixedDelay::hours(12))
        );
        assert_eq!(
            "1D".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Fixed(FixedDelay::days(1))
        );
    }

    #[test]
    fn rejects_malformed_strategies() {
        for raw in ["", "pow", "pow0", "0m", "1.5m", "powN", "5s", "m", "5 m", "-1h", "never"] {
            assert!(
                raw.parse::<RetryStrategy>().is_err(),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn power_backoff_grows_with_retries() {
        let pow2 = RetryStrategy::Power(2);
        assert_eq!(pow2.backoff(1), Some(Duration::from_secs(60)));
        assert_eq!(pow2.backoff(4), Some(Duration::from_secs(16 * 60)));

        let pow1 = RetryStrategy::default();
        assert_eq!(pow1.backoff(2), Some(Duration::from_secs(2 * 60)));
    }

    #[test]
    fn fixed_backoff_ignores_retries() {
        let five = RetryStrategy::Fixed(FixedDelay::minutes(5));
        assert_eq!(five.backoff(1), five.backoff(9));
        assert_eq!(five.backoff(3), Some(Duration::from_secs(300)));

        let hours = RetryStrategy::Fixed(FixedDelay::hours(2));
        assert_eq!(hours.backoff(1), Some(Duration::from_secs(2 * 3600)));

        let days = RetryStrategy::Fixed(FixedDelay::days(1));
        assert_eq!(days.backoff(7), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn none_never_backs_off() {
        assert_eq!(RetryStrategy::None.backoff(3), None);
    }

    #[test]
    fn huge_exponents_saturate_instead_of_overflowing() {
        let delay = RetryStrategy::Power(64).backoff(10).unwrap();
        assert_eq!(delay, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn serializes_as_canonical_text() {
        let json = serde_json::to_string(&RetryStrategy::Fixed(FixedDelay::hours(3))).unwrap();
        assert_eq!(json, "\"3h\"");

        let parsed: RetryStrategy = serde_json::from_str("\"Pow4\"").unwrap();
        assert_eq!(parsed, RetryStrategy::Power(4));

        assert!(serde_json::from_str::<RetryStrategy>("\"pow\"").is_err());
    }

    proptest! {
        #[test]
        fn display_then_parse_is_stable(n in 1u32..10_000, kind in 0u8..4) {
            let strategy = match kind {
                0 => RetryStrategy::Power(n),
                1 => RetryStrategy::Fixed(FixedDelay::minutes(n)),
                2 => RetryStrategy::Fixed(FixedDelay::hours(n)),
                _ => RetryStrategy::Fixed(FixedDelay::days(n)),
            };
            let reparsed: RetryStrategy = strategy.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, strategy);
        }

        #[test]
        fn arbitrary_text_never_panics(raw in "\\PC{0,12}") {
            let _ = raw.parse::<RetryStrategy>();
        }
    }
}
