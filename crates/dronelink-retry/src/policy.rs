//! Resend policy: how often, how far apart, and for how long.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest single resend delay or jitter a validated policy allows.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// How the delay between resends evolves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Every resend waits the send's own timeout.
    #[default]
    Fixed,
    /// The n-th resend waits `timeout * factor^n`, capped at `max_delay`.
    Exponential {
        /// Growth factor per resend. Values below 1.0 are clamped to 1.0.
        factor: f64,
        /// Upper bound for a single delay. Never below the send timeout.
        max_delay: Duration,
    },
}

/// Retry behaviour for sends that expect a reply.
///
/// The default resends forever at a fixed interval with no jitter: a peer
/// that never answers is polled until the link is closed. Set
/// `max_attempts` to give up after a number of resends, and `backoff` or
/// `jitter` to spread resends out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum resends per pattern. `None` = resend until answered.
    pub max_attempts: Option<u32>,
    /// Delay growth between resends.
    pub backoff: Backoff,
    /// Random extra delay (0..=jitter) added to every timer.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Resend forever at a fixed interval.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Resend at a fixed interval, at most `max_attempts` times.
    pub fn capped(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    /// Clamp out-of-range values so the policy is safe to use.
    ///
    /// Called automatically by [`RetryRegister::new`](crate::RetryRegister::new).
    /// Rules:
    /// - exponential `factor` below 1.0 (or NaN) becomes 1.0
    /// - infinite `factor` becomes 2.0
    /// - `max_delay` and `jitter` above [`MAX_RETRY_DELAY`] become
    ///   [`MAX_RETRY_DELAY`]
    pub fn validated(mut self) -> Self {
        if self.jitter > MAX_RETRY_DELAY {
            warn!(jitter = ?self.jitter, clamped = ?MAX_RETRY_DELAY, "retry jitter too large, clamping");
            self.jitter = MAX_RETRY_DELAY;
        }
        if let Backoff::Exponential { factor, max_delay } = self.backoff {
            let fixed = if factor.is_nan() || factor < 1.0 {
                1.0
            } else if factor.is_infinite() {
                2.0
            } else {
                factor
            };
            if fixed != factor {
                warn!(factor, clamped = fixed, "backoff factor out of range, clamping");
            }
            if max_delay > MAX_RETRY_DELAY {
                warn!(max_delay = ?max_delay, clamped = ?MAX_RETRY_DELAY, "backoff cap too large, clamping");
            }
            self.backoff = Backoff::Exponential {
                factor: fixed,
                max_delay: max_delay.min(MAX_RETRY_DELAY),
            };
        }
        self
    }

    /// `true` once `resends` resends have used up the budget.
    pub fn exhausted(&self, resends: u32) -> bool {
        self.max_attempts.is_some_and(|max| resends >= max)
    }

    /// Delay before the timer that follows `resends` earlier resends fires.
    pub fn delay(&self, timeout: Duration, resends: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => timeout,
            Backoff::Exponential { factor, max_delay } => {
                let cap = max_delay.max(timeout);
                let exp = i32::try_from(resends).unwrap_or(i32::MAX);
                let secs = (timeout.as_secs_f64() * factor.powi(exp)).min(cap.as_secs_f64());
                Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
            }
        };
        base.saturating_add(self.jitter_sample())
    }

    fn jitter_sample(&self) -> Duration {
        let max_us = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        if max_us == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..=max_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_default_is_unbounded_fixed_without_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.backoff, Backoff::Fixed);
        assert_eq!(policy.jitter, Duration::ZERO);
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_fixed_delay_is_timeout() {
        let policy = RetryPolicy::unbounded();
        for n in [0, 1, 10, 1000] {
            assert_eq!(policy.delay(TIMEOUT, n), TIMEOUT);
        }
    }

    #[test]
    fn test_exponential_delay_grows_then_caps() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                factor: 2.0,
                max_delay: Duration::from_millis(500),
            },
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(TIMEOUT, 0), Duration::from_millis(100));
        assert_eq!(policy.delay(TIMEOUT, 1), Duration::from_millis(200));
        assert_eq!(policy.delay(TIMEOUT, 2), Duration::from_millis(400));
        assert_eq!(policy.delay(TIMEOUT, 3), Duration::from_millis(500));
        assert_eq!(policy.delay(TIMEOUT, u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_cap_never_below_timeout() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                factor: 3.0,
                max_delay: Duration::from_millis(10),
            },
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(TIMEOUT, 4), TIMEOUT);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(20),
            ..RetryPolicy::default()
        };
        for _ in 0..200 {
            let d = policy.delay(TIMEOUT, 0);
            assert!(d >= TIMEOUT && d <= TIMEOUT + Duration::from_millis(20));
        }
    }

    #[test]
    fn test_capped_is_exhausted_at_max() {
        let policy = RetryPolicy::capped(3);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(RetryPolicy::capped(0).exhausted(0));
    }

    #[test]
    fn test_uncapped_exponential_backoff_does_not_overflow() {
        let raw = RetryPolicy {
            backoff: Backoff::Exponential {
                factor: 2.0,
                max_delay: Duration::MAX,
            },
            jitter: Duration::MAX,
            ..RetryPolicy::default()
        };
        // Unvalidated: saturates instead of panicking.
        assert_eq!(raw.delay(TIMEOUT, 200), Duration::MAX);

        let policy = raw.validated();
        assert_eq!(policy.jitter, MAX_RETRY_DELAY);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                factor: 2.0,
                max_delay: MAX_RETRY_DELAY,
            }
        );
        assert!(policy.delay(TIMEOUT, 200) <= MAX_RETRY_DELAY * 2);
        assert!(policy.delay(TIMEOUT, 1) >= Duration::from_millis(200));
    }

    #[test]
    fn test_validated_clamps_bad_factors() {
        for (bad, good) in [(0.5, 1.0), (f64::NAN, 1.0), (f64::INFINITY, 2.0), (1.5, 1.5)] {
            let policy = RetryPolicy {
                backoff: Backoff::Exponential {
                    factor: bad,
                    max_delay: Duration::from_secs(1),
                },
                ..RetryPolicy::default()
            }
            .validated();
            match policy.backoff {
                Backoff::Exponential { factor, .. } => assert_eq!(factor, good),
                Backoff::Fixed => panic!("backoff kind must be preserved"),
            }
        }
    }
}
