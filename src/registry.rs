//! Reference-counted subscription registry
//!
//! Maps each `SubscriptionKey` to the set of downstream clients interested in
//! it. A record exists only while at least one client holds the key, so the
//! provider sees exactly one subscribe and one unsubscribe per distinct key no
//! matter how many clients come and go.

use std::collections::{HashMap, HashSet};

use crate::core::{Provider, SubscriptionKey};

/// Downstream connection identifier
pub type ClientId = u64;

/// Upstream call the caller must issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAction {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
}

impl UpstreamAction {
    pub fn key(&self) -> &SubscriptionKey {
        match self {
            UpstreamAction::Subscribe(key) | UpstreamAction::Unsubscribe(key) => key,
        }
    }
}

#[derive(Debug, Default)]
struct SubscriptionRecord {
    /// Client -> requested history depth
    clients: HashMap<ClientId, u32>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    records: HashMap<SubscriptionKey, SubscriptionRecord>,
    by_client: HashMap<ClientId, HashSet<SubscriptionKey>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `key`; `Subscribe` is returned for the first client only
    pub fn subscribe(
        &mut self,
        client: ClientId,
        key: SubscriptionKey,
        history_depth: u32,
    ) -> Option<UpstreamAction> {
        let is_new = !self.records.contains_key(&key);
        self.records
            .entry(key.clone())
            .or_default()
            .clients
            .insert(client, history_depth);
        self.by_client.entry(client).or_default().insert(key.clone());

        is_new.then(|| UpstreamAction::Subscribe(key))
    }

    /// Remove `client` from `key`; `Unsubscribe` is returned when nobody is left
    pub fn unsubscribe(&mut self, client: ClientId, key: &SubscriptionKey) -> Option<UpstreamAction> {
        if let Some(keys) = self.by_client.get_mut(&client) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_client.remove(&client);
            }
        }

        let record = self.records.get_mut(key)?;
        if record.clients.remove(&client).is_none() {
            return None;
        }
        if record.clients.is_empty() {
            self.records.remove(key);
            return Some(UpstreamAction::Unsubscribe(key.clone()));
        }
        None
    }

    /// Release every key held by a disconnected client
    pub fn release_client(&mut self, client: ClientId) -> Vec<UpstreamAction> {
        let keys = match self.by_client.remove(&client) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        let mut keys: Vec<SubscriptionKey> = keys.into_iter().collect();
        keys.sort();

        keys.iter()
            .filter_map(|key| {
                let record = self.records.get_mut(key)?;
                record.clients.remove(&client);
                if record.clients.is_empty() {
                    self.records.remove(key);
                    Some(UpstreamAction::Unsubscribe(key.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Clients currently subscribed to `key`
    pub fn clients(&self, key: &SubscriptionKey) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .records
            .get(key)
            .map(|r| r.clients.keys().copied().collect())
            .unwrap_or_default();
        clients.sort_unstable();
        clients
    }

    pub fn reference_count(&self, key: &SubscriptionKey) -> usize {
        self.records.get(key).map_or(0, |r| r.clients.len())
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.records.contains_key(key)
    }

    /// Largest history depth any client asked for
    pub fn history_depth(&self, key: &SubscriptionKey) -> Option<u32> {
        self.records
            .get(key)
            .and_then(|r| r.clients.values().copied().max())
    }

    pub fn keys_for(&self, provider: Provider) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .records
            .keys()
            .filter(|k| k.provider == provider)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn keys_of(&self, client: ClientId) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .by_client
            .get(&client)
            .map(|k| k.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
