//! Client subscription table and request queue
//!
//! `ClientState` is the synchronous core of the connection manager. The
//! subscription table is the source of truth for what this client wants: it
//! survives every socket close and is replayed on each open. Requests made
//! while the socket is not ready wait in a `RequestQueue` and are flushed in
//! FIFO order before the replay.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Level;

use crate::core::SubscriptionKey;
use crate::log_client;
use crate::protocol::{ClientMessage, ServerMessage};

/// Subscriber callback; must tolerate duplicates
pub type Callback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Outbound requests held while the connection is not ready
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: VecDeque<ClientMessage>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ClientMessage) {
        self.queue.push_back(message);
    }

    /// Take everything in FIFO order
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    /// Drop queued requests for `key`
    pub fn purge(&mut self, key: &SubscriptionKey) {
        self.queue.retain(|m| &m.key() != key);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct SubscriptionEntry {
    callbacks: BTreeMap<u64, Callback>,
    history_depth: u32,
}

fn package_request(key: &SubscriptionKey, lookback_days: u32) -> ClientMessage {
    ClientMessage::GetSymbolDataPackage {
        symbol: key.symbol.clone(),
        provider: key.provider,
        lookback_days,
    }
}

#[derive(Default)]
pub struct ClientState {
    table: BTreeMap<SubscriptionKey, SubscriptionEntry>,
    queue: RequestQueue,
    /// Present only while the socket is ready
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    next_id: u64,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.outbound.is_some()
    }

    /// Register a callback; returns its id
    ///
    /// The first callback for a key subscribes and requests a package; later
    /// callbacks only request a fresh package.
    pub fn subscribe(&mut self, key: SubscriptionKey, callback: Callback, history_depth: u32) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        let is_new = !self.table.contains_key(&key);
        let entry = self.table.entry(key.clone()).or_insert_with(|| SubscriptionEntry {
            callbacks: BTreeMap::new(),
            history_depth,
        });
        entry.callbacks.insert(id, callback);
        entry.history_depth = entry.history_depth.max(history_depth);
        let depth = entry.history_depth;

        if is_new {
            self.send(ClientMessage::subscribe(&key, depth));
        }
        self.send(package_request(&key, depth));
        id
    }

    /// Remove one callback; the key is released when none remain
    pub fn unsubscribe(&mut self, key: &SubscriptionKey, id: u64) {
        let entry = match self.table.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        if entry.callbacks.remove(&id).is_none() || !entry.callbacks.is_empty() {
            return;
        }
        self.table.remove(key);

        if self.is_ready() {
            self.send(ClientMessage::unsubscribe(key));
        } else {
            // The relay has not seen this key on the next connection yet
            self.queue.purge(key);
        }
    }

    /// Send now when ready, queue otherwise
    fn send(&mut self, message: ClientMessage) {
        let message = match &self.outbound {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    log_client!(Level::DEBUG, "Socket task gone, queueing request");
                    self.outbound = None;
                    message
                }
            },
            None => message,
        };
        self.queue.push(message);
    }

    /// Socket became ready: flush the queue, then replay the table
    ///
    /// Keys whose subscribe or package request was just flushed are not
    /// requested again, so every key gets exactly one fresh request.
    pub fn on_open(&mut self, outbound: mpsc::UnboundedSender<ClientMessage>) {
        self.outbound = Some(outbound);

        let flushed = self.queue.drain();
        let mut subscribed = HashSet::new();
        let mut requested = HashSet::new();
        for message in &flushed {
            match message {
                ClientMessage::Subscribe { .. } => {
                    subscribed.insert(message.key());
                }
                ClientMessage::GetSymbolDataPackage { .. } => {
                    requested.insert(message.key());
                }
                ClientMessage::Unsubscribe { .. } => {}
            }
        }
        log_client!(
            Level::INFO,
            "Ready: flushing {} queued requests, resubscribing {} keys",
            flushed.len(),
            self.table.len()
        );
        for message in flushed {
            self.send(message);
        }

        let replay: Vec<(SubscriptionKey, u32)> = self
            .table
            .iter()
            .map(|(key, entry)| (key.clone(), entry.history_depth))
            .collect();
        for (key, depth) in replay {
            if !subscribed.contains(&key) {
                self.send(ClientMessage::subscribe(&key, depth));
            }
            if !requested.contains(&key) {
                self.send(package_request(&key, depth));
            }
        }
    }

    /// Socket closed; the table is kept for the next `on_open`
    pub fn on_close(&mut self) {
        self.outbound = None;
    }

    /// Callbacks interested in `message`
    ///
    /// Key-scoped messages go to that key's callbacks; provider-wide status
    /// goes to every key of that provider.
    pub fn callbacks_for(&self, message: &ServerMessage) -> Vec<Callback> {
        if let Some(key) = message.key() {
            return self
                .table
                .get(&key)
                .map(|e| e.callbacks.values().cloned().collect())
                .unwrap_or_default();
        }
        match message {
            ServerMessage::Status {
                provider: Some(provider),
                ..
            } => self
                .table
                .iter()
                .filter(|(key, _)| key.provider == *provider)
                .flat_map(|(_, e)| e.callbacks.values().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.table.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.table.contains_key(key)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Provider, Tick};
    use parking_lot::Mutex;

    fn key(symbol: &str) -> SubscriptionKey {
        SubscriptionKey::new(symbol, Provider::Stream)
    }

    fn noop() -> Callback {
        Arc::new(|_: &ServerMessage| {})
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_requests_queue_until_open() {
        let mut state = ClientState::new();
        state.subscribe(key("EURUSD"), noop(), 5);
        assert_eq!(state.queued(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        assert_eq!(
            sent(&mut rx),
            vec![
                ClientMessage::subscribe(&key("EURUSD"), 5),
                package_request(&key("EURUSD"), 5),
            ]
        );
        assert_eq!(state.queued(), 0);
    }

    #[test]
    fn test_table_survives_reconnect_cycles() {
        let mut state = ClientState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        state.subscribe(key("EURUSD"), noop(), 5);
        state.subscribe(key("GBPUSD"), noop(), 10);
        sent(&mut rx);

        for _ in 0..3 {
            state.on_close();
            assert_eq!(state.keys(), vec![key("EURUSD"), key("GBPUSD")]);

            let (tx, mut rx) = mpsc::unbounded_channel();
            state.on_open(tx);
            assert_eq!(
                sent(&mut rx),
                vec![
                    ClientMessage::subscribe(&key("EURUSD"), 5),
                    package_request(&key("EURUSD"), 5),
                    ClientMessage::subscribe(&key("GBPUSD"), 10),
                    package_request(&key("GBPUSD"), 10),
                ]
            );
        }
    }

    #[test]
    fn test_queue_flushed_before_replay_without_duplicates() {
        let mut state = ClientState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        state.subscribe(key("EURUSD"), noop(), 5);
        state.on_close();

        // Made while offline: queued
        state.subscribe(key("XAUUSD"), noop(), 1);
        // Second callback on a known key: only a package request is queued
        state.subscribe(key("EURUSD"), noop(), 5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        assert_eq!(
            sent(&mut rx),
            vec![
                ClientMessage::subscribe(&key("XAUUSD"), 1),
                package_request(&key("XAUUSD"), 1),
                package_request(&key("EURUSD"), 5),
                ClientMessage::subscribe(&key("EURUSD"), 5),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_after_last_callback() {
        let mut state = ClientState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        let first = state.subscribe(key("EURUSD"), noop(), 5);
        let second = state.subscribe(key("EURUSD"), noop(), 5);
        sent(&mut rx);

        state.unsubscribe(&key("EURUSD"), first);
        assert!(sent(&mut rx).is_empty());
        state.unsubscribe(&key("EURUSD"), second);
        assert_eq!(sent(&mut rx), vec![ClientMessage::unsubscribe(&key("EURUSD"))]);
        assert!(!state.is_subscribed(&key("EURUSD")));
    }

    #[test]
    fn test_offline_unsubscribe_purges_queue() {
        let mut state = ClientState::new();
        let id = state.subscribe(key("EURUSD"), noop(), 5);
        state.unsubscribe(&key("EURUSD"), id);
        assert_eq!(state.queued(), 0);
    }

    #[test]
    fn test_dead_socket_falls_back_to_queue() {
        let mut state = ClientState::new();
        let (tx, rx) = mpsc::unbounded_channel();
        state.on_open(tx);
        drop(rx);

        state.subscribe(key("EURUSD"), noop(), 5);
        assert!(!state.is_ready());
        assert_eq!(state.queued(), 2);
    }

    #[test]
    fn test_duplicate_ticks_leave_same_last_value() {
        let mut state = ClientState::new();
        let last = Arc::new(Mutex::new(None));
        let sink = last.clone();
        state.subscribe(
            key("EURUSD"),
            Arc::new(move |m: &ServerMessage| {
                if let ServerMessage::Tick(t) = m {
                    *sink.lock() = Some((t.bid, t.ask));
                }
            }),
            5,
        );

        let tick = ServerMessage::Tick(Tick {
            symbol: "EURUSD".into(),
            provider: Provider::Stream,
            bid: 1.0851,
            ask: 1.0852,
            timestamp: 7,
        });
        for _ in 0..2 {
            for callback in state.callbacks_for(&tick) {
                callback(&tick);
            }
            assert_eq!(*last.lock(), Some((1.0851, 1.0852)));
        }
    }

    #[test]
    fn test_provider_status_routed_to_provider_keys() {
        let mut state = ClientState::new();
        state.subscribe(key("EURUSD"), noop(), 5);
        state.subscribe(SubscriptionKey::new("EURUSD", Provider::Chart), noop(), 5);

        let status = ServerMessage::Status {
            state: crate::protocol::StatusState::Connecting,
            symbol: None,
            provider: Some(Provider::Stream),
            message: None,
        };
        assert_eq!(state.callbacks_for(&status).len(), 1);
        assert!(state
            .callbacks_for(&ServerMessage::status(crate::protocol::StatusState::Connected))
            .is_empty());
    }
}
