//! Bounded exponential backoff for reconnection.
//!
//! The delay before attempt `n` (1-based) is
//! `min(initial_delay * multiplier^(n-1), max_delay)`. After `max_attempts`
//! attempts without a successful activation the backoff is exhausted.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay before the given 1-based attempt.
pub fn delay_for_attempt(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    config
        .multiplier
        .checked_pow(exponent)
        .and_then(|factor| config.initial_delay.checked_mul(factor))
        .map_or(config.max_delay, |delay| delay.min(config.max_delay))
}

/// Attempt counter and delay schedule for one session.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Count another attempt and return how long to wait before making it,
    /// or `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(delay_for_attempt(&self.config, self.attempt))
    }

    /// Back to zero after a successful (re)connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
