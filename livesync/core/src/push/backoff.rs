//! Reconnect Backoff

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the reconnect delay grows between attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt, capped at the maximum
    Exponential,
}

/// Reconnect delay state for one channel
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base`
    #[must_use]
    pub fn new(policy: BackoffPolicy, base: Duration, max: Duration) -> Self {
        Self {
            policy,
            base,
            max: max.max(base),
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Add up to `ratio` of random extra delay (0.0..=1.0)
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay for attempt N (0-indexed), without jitter
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.policy {
            BackoffPolicy::Fixed => self.base,
            BackoffPolicy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                self.base.saturating_mul(factor).min(self.max)
            }
        }
    }

    /// Delay before the next attempt, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter > 0.0 {
            let extra = rand::random::<f64>() * self.jitter;
            delay.mul_f64(1.0 + extra)
        } else {
            delay
        }
    }

    /// Back to the base delay (after a successful round-trip)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
