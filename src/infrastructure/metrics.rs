//! Relay metrics
//!
//! Lock-free counters updated by the hub and the server tasks.
//! Snapshots are taken for the status API.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use crate::core::Provider;

/// Per-provider counters
#[derive(Default)]
struct ProviderCounters {
    ticks: AtomicU64,
    rate_limited: AtomicU64,
    disconnects: AtomicU64,
    connected: AtomicBool,
}

/// Relay metrics collector
pub struct RelayMetrics {
    stream: ProviderCounters,
    chart: ProviderCounters,
    packages_sent: AtomicU64,
    degraded_packages: AtomicU64,
    timeouts: AtomicU64,
    clients_connected: AtomicU64,
    active_keys: AtomicU64,
    stale_keys: AtomicU64,
    /// Last tick timestamp (Unix millis)
    last_tick_time: AtomicU64,
    start_time: Instant,
}

/// Per-provider part of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub connected: bool,
    pub ticks: u64,
    pub rate_limited: u64,
    pub disconnects: u64,
}

/// Metrics snapshot for API export
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub stream: ProviderSnapshot,
    pub chart: ProviderSnapshot,
    pub packages_sent: u64,
    pub degraded_packages: u64,
    pub timeouts: u64,
    pub clients_connected: u64,
    pub active_keys: u64,
    pub stale_keys: u64,
    pub tick_rate: f64,
    pub uptime_seconds: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            stream: ProviderCounters::default(),
            chart: ProviderCounters::default(),
            packages_sent: AtomicU64::new(0),
            degraded_packages: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            active_keys: AtomicU64::new(0),
            stale_keys: AtomicU64::new(0),
            last_tick_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn provider(&self, provider: Provider) -> &ProviderCounters {
        match provider {
            Provider::Stream => &self.stream,
            Provider::Chart => &self.chart,
        }
    }

    #[inline]
    pub fn record_tick(&self, provider: Provider) {
        self.provider(provider).ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_time.store(crate::provider::epoch_millis(), Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self, provider: Provider) {
        self.provider(provider).rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, provider: Provider) {
        self.provider(provider).disconnects.fetch_add(1, Ordering::Relaxed);
        self.set_connected(provider, false);
    }

    pub fn set_connected(&self, provider: Provider, connected: bool) {
        self.provider(provider).connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_package(&self, degraded: bool) {
        self.packages_sent.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded_packages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        let _ = self
            .clients_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set_key_counts(&self, active: usize, stale: usize) {
        self.active_keys.store(active as u64, Ordering::Relaxed);
        self.stale_keys.store(stale as u64, Ordering::Relaxed);
    }

    /// Milliseconds since the last tick, capped at 10s
    pub fn tick_age_ms(&self) -> u64 {
        let last = self.last_tick_time.load(Ordering::Relaxed);
        if last == 0 {
            return 10_000;
        }
        crate::provider::epoch_millis().saturating_sub(last).min(10_000)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let provider = |c: &ProviderCounters| ProviderSnapshot {
            connected: c.connected.load(Ordering::Relaxed),
            ticks: c.ticks.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
        };
        let stream = provider(&self.stream);
        let chart = provider(&self.chart);

        let uptime = self.start_time.elapsed().as_secs();
        let tick_rate = if uptime > 0 {
            (stream.ticks + chart.ticks) as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            stream,
            chart,
            packages_sent: self.packages_sent.load(Ordering::Relaxed),
            degraded_packages: self.degraded_packages.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            active_keys: self.active_keys.load(Ordering::Relaxed),
            stale_keys: self.stale_keys.load(Ordering::Relaxed),
            tick_rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
