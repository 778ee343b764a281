//! Outbound request pacing
//!
//! Providers reject bursts. Every outbound request goes through a
//! `PacedOutbox`: requests queue in FIFO order and are released no faster than
//! `max_requests` per sliding `window`. A rate-limited request is put back at
//! the front of the queue and the outbox pauses before retrying.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window rate limiter
#[derive(Debug, Clone)]
pub struct RequestPacer {
    max_requests: usize,
    window: Duration,
    /// Send times inside the current window, oldest first
    sent: VecDeque<Instant>,
    /// No sends before this instant (set after a provider rejection)
    paused_until: Option<Instant>,
}

impl RequestPacer {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            sent: VecDeque::with_capacity(max_requests.max(1)),
            paused_until: None,
        }
    }

    fn evict_old(&mut self, now: Instant) {
        while let Some(&front) = self.sent.front() {
            if front + self.window <= now {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Earliest instant at which a send is allowed
    pub fn next_available(&mut self, now: Instant) -> Instant {
        self.evict_old(now);
        let window_free = if self.sent.len() < self.max_requests {
            now
        } else {
            // len >= max_requests >= 1
            self.sent[self.sent.len() - self.max_requests] + self.window
        };
        match self.paused_until {
            Some(until) if until > window_free => until,
            _ => window_free,
        }
    }

    /// Take a send slot if one is free at `now`
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.next_available(now) > now {
            return false;
        }
        self.paused_until = None;
        self.sent.push_back(now);
        true
    }

    /// Block all sends until `until`
    pub fn pause_until(&mut self, until: Instant) {
        self.paused_until = Some(self.paused_until.map_or(until, |p| p.max(until)));
    }

    /// Sends counted in the window ending at `now`
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict_old(now);
        self.sent.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn reset(&mut self) {
        self.sent.clear();
        self.paused_until = None;
    }
}

/// FIFO request queue released through a `RequestPacer`
#[derive(Debug)]
pub struct PacedOutbox<T> {
    pacer: RequestPacer,
    queue: VecDeque<T>,
}

impl<T> PacedOutbox<T> {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            pacer: RequestPacer::new(max_requests, window),
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, request: T) {
        self.queue.push_back(request);
    }

    /// Put a rejected request back at the head and wait one full window
    pub fn requeue_after_rejection(&mut self, request: T, now: Instant) {
        self.queue.push_front(request);
        let window = self.pacer.window();
        self.pacer.pause_until(now + window);
    }

    /// When the head of the queue may be sent; `None` if the queue is empty
    pub fn next_due(&mut self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        Some(self.pacer.next_available(now))
    }

    /// Pop the head if it may be sent at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.queue.is_empty() || !self.pacer.try_acquire(now) {
            return None;
        }
        self.queue.pop_front()
    }

    /// Drop queued requests matching `pred`
    pub fn retain(&mut self, pred: impl FnMut(&T) -> bool) {
        self.queue.retain(pred);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Forget queued requests and window history (fresh connection)
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pacer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Drain an outbox the way a session loop does: sleep until due, pop everything due
    fn drain(outbox: &mut PacedOutbox<usize>, start: Instant) -> Vec<(usize, Instant)> {
        let mut now = start;
        let mut sent = Vec::new();
        while let Some(due) = outbox.next_due(now) {
            now = now.max(due);
            while let Some(item) = outbox.pop_due(now) {
                sent.push((item, now));
            }
        }
        sent
    }

    #[test]
    fn test_burst_of_thirty_is_paced() {
        let start = Instant::now();
        let mut outbox = PacedOutbox::new(5, Duration::from_secs(1));
        for i in 0..30 {
            outbox.push(i);
        }

        let sent = drain(&mut outbox, start);
        assert_eq!(sent.len(), 30);
        assert!(sent.iter().map(|(i, _)| *i).eq(0..30));

        for (_, t) in &sent {
            let in_window = sent
                .iter()
                .filter(|(_, s)| *s >= *t && *s < *t + Duration::from_secs(1))
                .count();
            assert!(in_window <= 5);
        }
        assert_eq!(sent[29].1 - start, Duration::from_secs(5));
    }

    #[test]
    fn test_rejected_request_goes_first_after_pause() {
        let start = Instant::now();
        let mut outbox = PacedOutbox::new(5, Duration::from_secs(1));
        outbox.push(1);
        outbox.push(2);

        let first = outbox.pop_due(start).unwrap();
        outbox.requeue_after_rejection(first, start);
        assert!(outbox.pop_due(start + Duration::from_millis(500)).is_none());
        assert_eq!(outbox.next_due(start), Some(start + Duration::from_secs(1)));
        assert_eq!(outbox.pop_due(start + Duration::from_secs(1)), Some(1));
        assert_eq!(outbox.pop_due(start + Duration::from_secs(1)), Some(2));
    }

    #[test]
    fn test_empty_outbox_has_no_deadline() {
        let mut outbox: PacedOutbox<u8> = PacedOutbox::new(5, Duration::from_secs(1));
        assert_eq!(outbox.next_due(Instant::now()), None);
    }

    #[test]
    fn test_retain_and_clear() {
        let mut outbox = PacedOutbox::new(1, Duration::from_secs(1));
        for i in 0..4 {
            outbox.push(i);
        }
        outbox.retain(|i| i % 2 == 0);
        assert_eq!(outbox.len(), 2);
        outbox.clear();
        assert!(outbox.is_empty());
    }

    proptest! {
        #[test]
        fn prop_no_window_exceeds_limit(
            count in 1usize..80,
            max in 1usize..10,
            window_ms in 10u64..2_000,
        ) {
            let start = Instant::now();
            let window = Duration::from_millis(window_ms);
            let mut outbox = PacedOutbox::new(max, window);
            for i in 0..count {
                outbox.push(i);
            }

            let sent = drain(&mut outbox, start);
            prop_assert_eq!(sent.len(), count);
            for (_, t) in &sent {
                let in_window = sent
                    .iter()
                    .filter(|(_, s)| *s >= *t && *s < *t + window)
                    .count();
                prop_assert!(in_window <= max);
            }
        }
    }
}
