//! Multi-part response coordinator
//!
//! A symbol data package is assembled from independent provider parts that
//! arrive in any order. `begin` starts the deadline immediately so a request
//! that never receives a single part still times out. At most one pending
//! combination exists per key; a second `begin` reuses it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;

use crate::core::{PartPayload, PartType, SubscriptionKey, SymbolDataPackage};
use crate::log_relay;

#[derive(Debug)]
struct PendingCombination {
    required: Vec<PartType>,
    buffer: HashMap<PartType, PartPayload>,
    deadline: Instant,
}

impl PendingCombination {
    fn missing(&self) -> Vec<PartType> {
        self.required
            .iter()
            .filter(|p| !self.buffer.contains_key(p))
            .copied()
            .collect()
    }
}

/// Result of feeding one part
#[derive(Debug, Clone, PartialEq)]
pub enum PartOutcome {
    /// Every required part is present
    Combined(SymbolDataPackage),
    /// Still waiting for other parts
    Pending,
    /// No pending combination, deadline passed or part not required
    Discarded,
}

/// Deadline expiry for one key
#[derive(Debug, Clone, PartialEq)]
pub struct Timeout {
    pub key: SubscriptionKey,
    /// Degraded package, `None` when no part arrived at all
    pub partial: Option<SymbolDataPackage>,
    pub missing_parts: Vec<PartType>,
}

pub struct MessageCoordinator {
    deadline: Duration,
    pending: HashMap<SubscriptionKey, PendingCombination>,
}

impl MessageCoordinator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            pending: HashMap::new(),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Start waiting for `required` parts of `key`
    ///
    /// Returns `false` when a combination is already outstanding; its buffer
    /// and deadline are kept.
    pub fn begin(&mut self, key: SubscriptionKey, required: &[PartType], now: Instant) -> bool {
        if self.pending.contains_key(&key) {
            log_relay!(Level::DEBUG, key = %key, "Reusing outstanding combination");
            return false;
        }
        self.pending.insert(
            key,
            PendingCombination {
                required: required.to_vec(),
                buffer: HashMap::new(),
                deadline: now + self.deadline,
            },
        );
        true
    }

    pub fn on_part(
        &mut self,
        key: &SubscriptionKey,
        part: PartType,
        payload: PartPayload,
        now: Instant,
    ) -> PartOutcome {
        let pending = match self.pending.get_mut(key) {
            Some(p) => p,
            None => {
                log_relay!(Level::DEBUG, key = %key, "Discarding {:?}: nothing pending", part);
                return PartOutcome::Discarded;
            }
        };
        if now >= pending.deadline {
            log_relay!(Level::DEBUG, key = %key, "Discarding late {:?}", part);
            return PartOutcome::Discarded;
        }
        if !pending.required.contains(&part) {
            log_relay!(Level::DEBUG, key = %key, "Discarding unrequested {:?}", part);
            return PartOutcome::Discarded;
        }

        pending.buffer.insert(part, payload);
        if !pending.missing().is_empty() {
            return PartOutcome::Pending;
        }

        match self.pending.remove(key) {
            Some(done) => PartOutcome::Combined(SymbolDataPackage::assemble(key, &done.buffer, Vec::new())),
            None => PartOutcome::Discarded,
        }
    }

    /// Remove and report every combination whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<Timeout> {
        let expired: Vec<SubscriptionKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                let pending = self.pending.remove(&key)?;
                let missing_parts = pending.missing();
                log_relay!(
                    Level::WARN,
                    key = %key,
                    "Combination timed out, missing {:?}",
                    missing_parts
                );
                let partial = if pending.buffer.is_empty() {
                    None
                } else {
                    Some(SymbolDataPackage::assemble(&key, &pending.buffer, missing_parts.clone()))
                };
                Some(Timeout {
                    key,
                    partial,
                    missing_parts,
                })
            })
            .collect()
    }

    /// Earliest outstanding deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Drop a combination nobody waits for any more
    pub fn cancel(&mut self, key: &SubscriptionKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &SubscriptionKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bar, Provider, SymbolMetadata};

    const DEADLINE: Duration = Duration::from_secs(10);
    const CHART_PARTS: [PartType; 2] = [PartType::SeriesA, PartType::SeriesB];

    fn chart_key() -> SubscriptionKey {
        SubscriptionKey::new("EURUSD", Provider::Chart)
    }

    fn bars(close: f64) -> PartPayload {
        PartPayload::Bars {
            bars: vec![Bar {
                time: 1_700_000_000_000,
                open: 1.08,
                high: 1.09,
                low: 1.07,
                close,
                volume: 0.0,
            }],
            metadata: Some(SymbolMetadata::new(5, 4)),
        }
    }

    #[test]
    fn test_combines_in_any_order() {
        let now = Instant::now();
        let mut coordinator = MessageCoordinator::new(DEADLINE);
        assert!(coordinator.begin(chart_key(), &CHART_PARTS, now));

        assert_eq!(
            coordinator.on_part(&chart_key(), PartType::SeriesB, bars(1.085), now),
            PartOutcome::Pending
        );
        match coordinator.on_part(&chart_key(), PartType::SeriesA, bars(1.08), now) {
            PartOutcome::Combined(package) => {
                assert!(package.is_complete());
                assert_eq!(package.digits, Some(5));
                assert_eq!(package.intraday_bars.len(), 1);
            }
            other => panic!("expected combined, got {:?}", other),
        }
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_missing_series_times_out_with_missing_parts() {
        let now = Instant::now();
        let mut coordinator = MessageCoordinator::new(DEADLINE);
        coordinator.begin(chart_key(), &CHART_PARTS, now);
        coordinator.on_part(&chart_key(), PartType::SeriesA, bars(1.08), now);

        assert!(coordinator.expire(now + Duration::from_secs(9)).is_empty());
        let timeouts = coordinator.expire(now + DEADLINE);
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].missing_parts, vec![PartType::SeriesB]);
        let partial = timeouts[0].partial.as_ref().unwrap();
        assert_eq!(partial.missing_parts, vec![PartType::SeriesB]);
        assert!(!partial.is_complete());
    }

    #[test]
    fn test_silent_request_still_times_out() {
        let now = Instant::now();
        let mut coordinator = MessageCoordinator::new(DEADLINE);
        coordinator.begin(chart_key(), &CHART_PARTS, now);

        assert_eq!(coordinator.next_deadline(), Some(now + DEADLINE));
        let timeouts = coordinator.expire(now + DEADLINE);
        assert_eq!(timeouts.len(), 1);
        assert!(timeouts[0].partial.is_none());
        assert_eq!(timeouts[0].missing_parts, CHART_PARTS.to_vec());
        assert_eq!(coordinator.next_deadline(), None);
    }

    #[test]
    fn test_second_begin_reuses_buffer() {
        let now = Instant::now();
        let mut coordinator = MessageCoordinator::new(DEADLINE);
        coordinator.begin(chart_key(), &CHART_PARTS, now);
        coordinator.on_part(&chart_key(), PartType::SeriesA, bars(1.08), now);

        assert!(!coordinator.begin(chart_key(), &CHART_PARTS, now + Duration::from_secs(5)));
        assert_eq!(coordinator.len(), 1);
        // Deadline still counts from the first begin
        assert_eq!(coordinator.next_deadline(), Some(now + DEADLINE));
        assert!(matches!(
            coordinator.on_part(&chart_key(), PartType::SeriesB, bars(1.085), now + Duration::from_secs(6)),
            PartOutcome::Combined(_)
        ));
    }

    #[test]
    fn test_late_and_unknown_parts_discarded() {
        let now = Instant::now();
        let mut coordinator = MessageCoordinator::new(DEADLINE);
        assert_eq!(
            coordinator.on_part(&chart_key(), PartType::SeriesA, bars(1.0), now),
            PartOutcome::Discarded
        );

        coordinator.begin(chart_key(), &CHART_PARTS, now);
        assert_eq!(
            coordinator.on_part(
                &chart_key(),
                PartType::Metadata,
                PartPayload::Metadata(SymbolMetadata::new(5, 4)),
                now
            ),
            PartOutcome::Discarded
        );

        coordinator.expire(now + DEADLINE);
        assert_eq!(
            coordinator.on_part(&chart_key(), PartType::SeriesB, bars(1.0), now + DEADLINE),
            PartOutcome::Discarded
        );
        assert!(coordinator.is_empty());
    }
}
