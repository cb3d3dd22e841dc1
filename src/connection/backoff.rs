//! Reconnect delay policy.
//!
//! Delay for attempt `n` is `min(base * 2^(n-1), max_delay)` plus a random
//! jitter of up to `jitter_ratio` of that capped value, clamped to an absolute
//! ceiling. Past `max_attempts` the counter resets and a single long cooldown
//! is used before the sequence starts over.

use crate::config::ServerConfig;
use std::time::Duration;

/// Upper bound on the jitter fraction.
pub const MAX_JITTER_RATIO: f64 = 0.3;

/// What to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Retry after `delay`; `attempt` is the attempt number it belongs to.
    Backoff { attempt: u32, delay: Duration },
    /// The attempt budget is spent: reset the counter and retry once after
    /// the cooldown.
    Cooldown { delay: Duration },
}

impl ReconnectStep {
    pub fn delay(&self) -> Duration {
        match self {
            Self::Backoff { delay, .. } | Self::Cooldown { delay } => *delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub ceiling_ms: u64,
    pub cooldown: Duration,
    pub jitter_ratio: f64,
    pub grace_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ReconnectPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            ceiling_ms: config.ceiling_ms,
            cooldown: Duration::from_secs(config.cooldown_secs),
            jitter_ratio: config.jitter_ratio.clamp(0.0, MAX_JITTER_RATIO),
            grace_window: Duration::from_millis(config.grace_window_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Capped exponential component for `attempt` (1-based), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Delay for `attempt` given a jitter sample in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let capped = self.base_delay_for_attempt(attempt) as f64;
        let jitter = capped * self.jitter_ratio * unit.clamp(0.0, 1.0);
        let total_ms = ((capped + jitter).round() as u64).min(self.ceiling_ms);
        Duration::from_millis(total_ms)
    }

    /// Delay for `attempt` with random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }

    /// Decide the next step once `attempts` (already incremented) is known.
    pub fn next_step(&self, attempts: u32) -> ReconnectStep {
        if attempts <= self.max_attempts {
            ReconnectStep::Backoff {
                attempt: attempts,
                delay: self.delay_for_attempt(attempts),
            }
        } else {
            ReconnectStep::Cooldown {
                delay: self.cooldown,
            }
        }
    }
}
