//! Reconnection Policy
//!
//! Backoff for connection attempts that fail before the stream opens. A
//! connection that reached the open state and later dropped is re-dialled
//! immediately and resets the policy; only consecutive failed dials back off.

use std::time::Duration;

use rand::Rng;

use crate::ReconnectSettings;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor applied after each retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive failed dials tolerated (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.delay_initial,
            max_delay: settings.delay_max,
            multiplier: settings.delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use binance_stream_client::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // The stream opened
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    base_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let base_delay = config.initial_delay;
        Self {
            config,
            base_delay,
            attempts: 0,
        }
    }

    /// Delay before the next dial, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.base_delay);
        self.base_delay = self.grown(self.base_delay);

        Some(delay)
    }

    /// Return to the initial delay after the stream opened.
    pub const fn reset(&mut self) {
        self.base_delay = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Consecutive delays handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn grown(&self, delay: Duration) -> Duration {
        let cap = self.config.max_delay;
        let scaled = (delay.as_millis() as f64 * self.config.multiplier.max(1.0)).round();
        if !scaled.is_finite() || scaled >= cap.as_millis() as f64 {
            return cap;
        }
        Duration::from_millis(scaled as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.config.jitter_factor.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor).max(Duration::from_millis(1))
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}
