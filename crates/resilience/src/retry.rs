//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::random;
use serde::{Deserialize, Serialize};

/// Retry schedule applied to one logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first; reaching it turns a transient failure
    /// into a permanent one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Relative jitter, e.g. `0.1` for ±10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (0-based).
    ///
    /// A server-provided `hint` (e.g. `Retry-After`) raises the delay but
    /// never beyond `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        let computed = Duration::from_secs_f64(jittered.min(self.max_backoff.as_secs_f64()));
        match hint {
            Some(hint) => computed.max(hint).min(self.max_backoff),
            None => computed,
        }
    }
}
