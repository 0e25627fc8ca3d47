//! Retry and polling policies.
//!
//! Both are configuration, not constants: each device kind gets its own
//! [`RetryPolicy`] (how transient transaction failures are retried) and
//! [`PollPolicy`] (how post-conditions are confirmed).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay.
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Defines how timed-out transactions are retried.
///
/// Malformed responses are always retried exactly once regardless of
/// `max_retries`; disconnects are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 disables retries.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(100),
            },
        }
    }
}

/// Post-condition polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    /// Upper bound on the wall time a full poll budget can take.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_polls)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_polls: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let b = Backoff::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(300),
        };
        assert_eq!(b.delay(1), Duration::from_millis(50));
        assert_eq!(b.delay(2), Duration::from_millis(100));
        assert_eq!(b.delay(3), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(300));
        assert_eq!(b.delay(40), Duration::from_millis(300));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let b = Backoff::Fixed {
            delay: Duration::from_millis(20),
        };
        assert_eq!(b.delay(1), b.delay(9));
    }

    #[test]
    fn policies_deserialize_from_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_retries = 2
            backoff = { kind = "exponential", initial = "10ms", max = "1s" }
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff.delay(2), Duration::from_millis(20));

        let poll: PollPolicy = toml::from_str("interval = \"250ms\"\nmax_polls = 8").unwrap();
        assert_eq!(poll.budget(), Duration::from_secs(2));
    }
}
