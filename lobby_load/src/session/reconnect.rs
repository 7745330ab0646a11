//! Bounded reconnect policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_millis() -> u64 {
    1_000
}

fn default_maximum_backoff_millis() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// How often, and how patiently, a virtual user reconnects after a transport
/// error.
pub struct Policy {
    /// Reconnects allowed over the whole life of a virtual user. Zero
    /// disables reconnecting.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause before the first reconnect
    #[serde(default = "default_initial_backoff_millis")]
    pub initial_backoff_millis: u64,
    /// Upper bound on any pause
    #[serde(default = "default_maximum_backoff_millis")]
    pub maximum_backoff_millis: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_millis: default_initial_backoff_millis(),
            maximum_backoff_millis: default_maximum_backoff_millis(),
        }
    }
}

impl Policy {
    /// Whether reconnect number `attempt`, counting from 1, is allowed.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// The pause before reconnect number `attempt`, counting from 1:
    /// `initial * 2^(attempt - 1)` capped at the maximum.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let millis = self
            .initial_backoff_millis
            .checked_mul(1_u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.maximum_backoff_millis);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_backoff_doubles_then_caps() {
        let policy = Policy::default();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| u64::try_from(policy.delay(attempt).as_millis()).expect("fits"))
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn zero_attempts_disables_reconnect() {
        let policy = Policy {
            max_attempts: 0,
            ..Policy::default()
        };
        assert!(!policy.allows(1));
    }

    #[test]
    fn allows_up_to_max() {
        let policy = Policy::default();
        assert!(policy.allows(1));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }

    proptest! {
        #[test]
        fn delay_is_monotone_and_capped(
            initial in 0u64..100_000,
            maximum in 0u64..1_000_000,
            attempt in 1u32..200,
        ) {
            let policy = Policy {
                max_attempts: u32::MAX,
                initial_backoff_millis: initial,
                maximum_backoff_millis: maximum,
            };
            let now = policy.delay(attempt);
            let next = policy.delay(attempt + 1);

            prop_assert!(now <= next);
            prop_assert!(next <= Duration::from_millis(maximum));
        }
    }
}
