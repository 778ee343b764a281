//! Per-key staleness detection
//!
//! Tracks when data last arrived for each subscription key. A key flips to
//! `Stale` once it has been quiet for longer than the threshold and back to
//! `Fresh` on the next activity. Each flip is reported exactly once.
//!
//! The monitor only surfaces the signal; it never touches connections.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;

use crate::core::SubscriptionKey;
use crate::log_relay;

/// Freshness of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    last_data_at: Instant,
    status: HealthStatus,
}

/// Transition reported by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Stale {
        key: SubscriptionKey,
        silent_for: Duration,
    },
    Resumed {
        key: SubscriptionKey,
    },
}

impl HealthEvent {
    pub fn key(&self) -> &SubscriptionKey {
        match self {
            HealthEvent::Stale { key, .. } | HealthEvent::Resumed { key } => key,
        }
    }
}

/// Staleness tracker for all active keys
pub struct HealthMonitor {
    stale_threshold: Duration,
    states: HashMap<SubscriptionKey, HealthState>,
}

impl HealthMonitor {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            stale_threshold,
            states: HashMap::new(),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Start tracking `key`; the quiet period counts from `now`
    pub fn track(&mut self, key: SubscriptionKey, now: Instant) {
        self.states.entry(key).or_insert(HealthState {
            last_data_at: now,
            status: HealthStatus::Fresh,
        });
    }

    pub fn untrack(&mut self, key: &SubscriptionKey) {
        self.states.remove(key);
    }

    /// Record a tick or metadata event; returns `Resumed` if the key was stale
    pub fn record_activity(&mut self, key: &SubscriptionKey, now: Instant) -> Option<HealthEvent> {
        let state = self.states.get_mut(key)?;
        state.last_data_at = now;
        if state.status == HealthStatus::Stale {
            state.status = HealthStatus::Fresh;
            log_relay!(Level::INFO, key = %key, "Data resumed");
            return Some(HealthEvent::Resumed { key: key.clone() });
        }
        None
    }

    /// Flip every quiet key to `Stale`, reporting only new transitions
    pub fn check_staleness(&mut self, now: Instant) -> Vec<HealthEvent> {
        let threshold = self.stale_threshold;
        let mut events = Vec::new();
        for (key, state) in self.states.iter_mut() {
            let silent_for = now.saturating_duration_since(state.last_data_at);
            if state.status == HealthStatus::Fresh && silent_for > threshold {
                state.status = HealthStatus::Stale;
                log_relay!(Level::WARN, key = %key, "No data for {:?}", silent_for);
                events.push(HealthEvent::Stale {
                    key: key.clone(),
                    silent_for,
                });
            }
        }
        events
    }

    pub fn status(&self, key: &SubscriptionKey) -> Option<HealthStatus> {
        self.states.get(key).map(|s| s.status)
    }

    /// Time since the last data for `key`
    pub fn silent_for(&self, key: &SubscriptionKey, now: Instant) -> Option<Duration> {
        self.states
            .get(key)
            .map(|s| now.saturating_duration_since(s.last_data_at))
    }

    pub fn stale_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.status == HealthStatus::Stale)
            .count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
