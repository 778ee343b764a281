//! Subscription keys
//!
//! A `(symbol, provider)` pair identifies one logical data stream. It is the
//! map key everywhere: client tables, registry records, coordinator buffers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::market_data::PartType;

/// Upstream market-data provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Binary frames over a TLS socket with auth handshake and fixed heartbeat
    Stream,
    /// Dual-series chart WebSocket
    Chart,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Stream, Provider::Chart];

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Stream => "stream",
            Provider::Chart => "chart",
        }
    }

    /// Parts that must arrive before a symbol data package is complete
    pub fn required_parts(&self) -> &'static [PartType] {
        match self {
            Provider::Stream => &[PartType::Metadata, PartType::SeriesA],
            Provider::Chart => &[PartType::SeriesA, PartType::SeriesB],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key of one logical subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub provider: Provider,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, provider: Provider) -> Self {
        Self {
            symbol: symbol.into(),
            provider,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.symbol)
    }
}
