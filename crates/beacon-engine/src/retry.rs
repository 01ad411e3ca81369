use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the wait between attempts grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential { max_interval_ms: u64 },
}

/// Retry behavior for the dispatcher.
///
/// `max_retries` bounds the total number of attempts, the first one
/// included. A value of 0 is treated as 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub backoff: Backoff,
    /// Fraction of the delay added or removed at random, 0.0..=1.0.
    pub jitter_factor: f64,
    /// Per-attempt network timeout.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 1_000,
            backoff: Backoff::Fixed,
            jitter_factor: 0.0,
            timeout_ms: 5_500,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.retry_interval_ms as f64;
        let delay = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential { max_interval_ms } => {
                let exp = base * 2.0_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                exp.min(max_interval_ms as f64)
            }
        };

        let factor = self.jitter_factor.clamp(0.0, 1.0);
        if factor == 0.0 || delay == 0.0 {
            return Duration::from_millis(delay as u64);
        }
        let range = delay * factor;
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.retry_interval(), Duration::from_secs(1));
        assert_eq!(policy.timeout(), Duration::from_millis(5_500));
        assert_eq!(policy.backoff, Backoff::Fixed);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential { max_interval_ms: 5_000 },
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            ..Default::default()
        };
        for _ in 0..100 {
            let ms = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn attempt_budget_counts_first_attempt() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));

        let zero = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert!(!zero.allows_retry(1));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.timeout_ms, 5_500);

        let exp: RetryPolicy =
            serde_json::from_str(r#"{"backoff": {"kind": "exponential", "max_interval_ms": 8000}}"#).unwrap();
        assert_eq!(exp.backoff, Backoff::Exponential { max_interval_ms: 8_000 });
    }
}
