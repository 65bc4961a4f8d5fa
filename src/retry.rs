//! Backoff shapes and the per-class retry policy.
//!
//! The client retries three families of failures in-process, each with its
//! own backoff curve: timeouts, transient network/5xx failures, and platform
//! socket errors. [`RetryPolicy`] bundles the attempt budget with those curves.

use crate::classify::ErrorClass;
use rand::Rng;
use std::time::Duration;

/// How long to wait between attempts.
///
/// # Examples
///
/// ```
/// use tartrack_net::retry::Backoff;
/// use std::time::Duration;
///
/// // 1s, 2s, 3s, 3s, ...
/// let backoff = Backoff::ExponentialBackoff {
///     initial_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(3),
///     jitter: false,
/// };
/// assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Retry immediately.
    None,

    /// Wait `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    ExponentialBackoff {
        /// The delay after the first failed attempt.
        initial_delay: Duration,
        /// The maximum delay between attempts.
        max_delay: Duration,
        /// Scale each delay by a random factor in `[0.5, 1.0]`.
        jitter: bool,
    },

    /// Wait the same delay after every failed attempt.
    Linear {
        /// The delay between attempts.
        delay: Duration,
    },
}

impl Backoff {
    /// Shorthand for a capped exponential curve without jitter.
    pub const fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Backoff::ExponentialBackoff {
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Returns the delay to apply after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::ExponentialBackoff {
                initial_delay,
                max_delay,
                jitter,
            } => {
                let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1) as u32);
                let base_delay =
                    initial_delay.saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));
                let delay = base_delay.min(*max_delay);

                if *jitter {
                    let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
                    delay.mul_f64(jitter_factor)
                } else {
                    delay
                }
            }
            Backoff::Linear { delay } => *delay,
        }
    }
}

/// Attempt budget and backoff curves for in-process retries.
///
/// Defaults: 3 attempts in total; timeouts back off 1s doubling to 3s,
/// network and 5xx failures 1s doubling to 5s, socket errors 2s doubling to 8s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts per request, including the first.
    pub max_attempts: usize,
    /// Backoff after a timed-out attempt.
    pub timeout_backoff: Backoff,
    /// Backoff after a connection-layer or 5xx failure.
    pub network_backoff: Backoff,
    /// Backoff after a platform socket error.
    pub socket_backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(3)),
            network_backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(5)),
            socket_backoff: Backoff::exponential(Duration::from_secs(2), Duration::from_secs(8)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Uses the same backoff for every retryable class.
    pub fn uniform(max_attempts: usize, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            timeout_backoff: backoff.clone(),
            network_backoff: backoff.clone(),
            socket_backoff: backoff,
        }
    }

    /// Returns the delay before the next attempt, or `None` when the class is
    /// not retried locally or the attempt budget is spent.
    pub fn delay_after(&self, class: ErrorClass, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let backoff = match class {
            ErrorClass::Timeout => &self.timeout_backoff,
            ErrorClass::Connection | ErrorClass::Server5xx => &self.network_backoff,
            ErrorClass::Socket => &self.socket_backoff,
            ErrorClass::RecoverableTransport | ErrorClass::Unknown => return None,
        };

        Some(backoff.delay_for_attempt(attempt))
    }
}
