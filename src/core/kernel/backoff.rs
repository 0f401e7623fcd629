//! Reconnection backoff
//!
//! Exponential backoff with symmetric jitter between reconnect attempts.

use crate::core::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff state for one sequence of reconnect attempts.
///
/// # Example
///
/// ```rust
/// use hyperstream::core::config::BackoffConfig;
/// use hyperstream::core::kernel::ReconnectPolicy;
///
/// let mut policy = ReconnectPolicy::new(BackoffConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // After a successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, `None` once `max_attempts` is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.apply_jitter(self.current_delay);

        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u128
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Back to the initial delay after a successful connection
    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Un-jittered delay the next call to `next_delay` is based on
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        Duration::from_millis(adjusted_millis as u64)
    }
}
