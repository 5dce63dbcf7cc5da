//! Reconnect delay policy.

use std::time::Duration;

/// Initial reconnect delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Reconnect delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff parameters: start at `initial`, double per failure,
/// never exceed `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay, and the delay after a successful reconnect.
    pub initial: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

/// Mutable backoff state of one subscription.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Starts at the policy's initial delay.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial.min(policy.max),
        }
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current delay and doubles it for the next failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.policy.max);
        self.current = next.min(self.policy.max);
        delay
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_sequence_doubles_to_cap() {
        let mut backoff = Backoff::new(BackoffPolicy::default());

        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(delays, [2, 4, 8, 16, 30, 30, 30]);
    }

    #[rstest]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_delays_are_monotonic_and_capped(
            initial_ms in 1u64..10_000,
            extra_ms in 0u64..120_000,
            failures in 1usize..40
        ) {
            let policy = BackoffPolicy {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(initial_ms + extra_ms),
            };
            let mut backoff = Backoff::new(policy);
            let mut previous = Duration::ZERO;

            for _ in 0..failures {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max);
                prop_assert!(delay >= policy.initial);
                previous = delay;
            }
        }
    }
}
