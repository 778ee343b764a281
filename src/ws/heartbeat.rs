//! Heartbeat tracking for provider sessions
//!
//! Tracks when the last heartbeat was sent and when the last inbound frame
//! arrived. A session that goes `interval * max_missed` without hearing from
//! the remote side is dead and must take the normal disconnect path.

use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    /// How often a heartbeat is sent (or expected)
    interval: Duration,
    /// Missed intervals tolerated before the connection is dead
    max_missed: u32,
    last_sent: Option<Instant>,
    last_inbound: Instant,
}

/// Tracker snapshot for logging and status
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatHealth {
    pub silent_for: Duration,
    pub missed: u32,
    pub is_dead: bool,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration, max_missed: u32, now: Instant) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
            last_sent: None,
            last_inbound: now,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record any inbound frame
    #[inline]
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Record a successful heartbeat send
    #[inline]
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Whole intervals elapsed without inbound traffic
    pub fn missed(&self, now: Instant) -> u32 {
        let silent = now.saturating_duration_since(self.last_inbound);
        let interval = self.interval.as_millis().max(1);
        (silent.as_millis() / interval).min(u32::MAX as u128) as u32
    }

    pub fn is_dead(&self, now: Instant) -> bool {
        self.missed(now) >= self.max_missed
    }

    /// Instant at which the connection will be declared dead
    pub fn deadline(&self) -> Instant {
        self.last_inbound + self.interval * self.max_missed
    }

    pub fn health(&self, now: Instant) -> HeartbeatHealth {
        HeartbeatHealth {
            silent_for: now.saturating_duration_since(self.last_inbound),
            missed: self.missed(now),
            is_dead: self.is_dead(now),
        }
    }

    /// Start over after a fresh connect
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = None;
        self.last_inbound = now;
    }
}
