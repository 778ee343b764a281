//! Reconnection backoff
//!
//! Exponential backoff state machine shared by the provider supervisors and
//! the client connection manager. Delays grow as `base * 2^attempt`, capped at
//! `cap`; after `max_attempts` failures the scheduler is exhausted and the
//! owner must surface a terminal failure instead of retrying.

use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Maximum delay between retries
    pub cap: Duration,
    /// Retries allowed before giving up (0 = never retry)
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Exponential backoff with bounded attempts
#[derive(Debug, Clone)]
pub struct ReconnectionScheduler {
    config: BackoffConfig,
    attempt: u32,
}

impl ReconnectionScheduler {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    ///
    /// Each call consumes one attempt.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = Self::delay_for(&self.config, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// `min(base * 2^attempt, cap)` without overflow
    fn delay_for(config: &BackoffConfig, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        config
            .base
            .checked_mul(factor)
            .map_or(config.cap, |d| d.min(config.cap))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed since the last reset
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ReconnectionScheduler {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
