//! Market data types
//!
//! Normalized ticks, bars and symbol metadata as reported by providers.
//! The relay only transports these fields; it never derives analytics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::key::{Provider, SubscriptionKey};

/// Best bid/ask tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub provider: Provider,
    pub bid: f64,
    pub ask: f64,
    /// Milliseconds since epoch
    pub timestamp: u64,
}

impl Tick {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol.clone(), self.provider)
    }
}

/// OHLC bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, milliseconds since epoch
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// Symbol precision metadata
///
/// Fetched lazily by a provider session and never overwritten afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolMetadata {
    pub digits: u32,
    pub pip_position: u32,
    pub pip_size: f64,
}

impl SymbolMetadata {
    pub fn new(digits: u32, pip_position: u32) -> Self {
        Self {
            digits,
            pip_position,
            pip_size: 10f64.powi(-(pip_position as i32)),
        }
    }

    /// Derive metadata from a chart price scale (100000 => 5 digits)
    ///
    /// Fractional-pip quotes (5 and 3 digits) put the pip one digit left of
    /// the last decimal.
    pub fn from_price_scale(price_scale: u64) -> Self {
        let digits = if price_scale > 1 {
            (price_scale as f64).log10().round() as u32
        } else {
            0
        };
        let pip_position = match digits {
            5 | 3 => digits - 1,
            d => d,
        };
        Self::new(digits, pip_position)
    }
}

/// Piece of a multi-part symbol data response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartType {
    Metadata,
    SeriesA,
    SeriesB,
}

/// Payload carried by one part
#[derive(Debug, Clone, PartialEq)]
pub enum PartPayload {
    Metadata(SymbolMetadata),
    Bars {
        bars: Vec<Bar>,
        metadata: Option<SymbolMetadata>,
    },
}

/// Cold state for one symbol, assembled from provider parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDataPackage {
    pub symbol: String,
    pub provider: Provider,
    pub digits: Option<u32>,
    pub pip_position: Option<u32>,
    pub pip_size: Option<f64>,
    pub open_price: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    /// Daily bars, oldest first
    pub history_bars: Vec<Bar>,
    /// Intraday bars, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intraday_bars: Vec<Bar>,
    /// Non-empty only for a degraded package delivered after a timeout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_parts: Vec<PartType>,
}

impl SymbolDataPackage {
    /// Build a package from whatever parts are present
    pub fn assemble(
        key: &SubscriptionKey,
        parts: &HashMap<PartType, PartPayload>,
        missing_parts: Vec<PartType>,
    ) -> Self {
        let mut metadata = None;
        let mut history_bars = Vec::new();
        let mut intraday_bars = Vec::new();

        for (part, payload) in parts {
            match payload {
                PartPayload::Metadata(meta) => metadata = Some(*meta),
                PartPayload::Bars { bars, metadata: meta } => {
                    if metadata.is_none() {
                        metadata = *meta;
                    }
                    match part {
                        PartType::SeriesB => intraday_bars = bars.clone(),
                        _ => history_bars = bars.clone(),
                    }
                }
            }
        }

        history_bars.sort_by_key(|b| b.time);
        intraday_bars.sort_by_key(|b| b.time);

        let (open_price, high, low) = session_range(&history_bars, &intraday_bars);

        Self {
            symbol: key.symbol.clone(),
            provider: key.provider,
            digits: metadata.map(|m| m.digits),
            pip_position: metadata.map(|m| m.pip_position),
            pip_size: metadata.map(|m| m.pip_size),
            open_price,
            high,
            low,
            history_bars,
            intraday_bars,
            missing_parts,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol.clone(), self.provider)
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts.is_empty()
    }
}

/// Today's open/high/low: latest daily bar, falling back to the intraday range
fn session_range(daily: &[Bar], intraday: &[Bar]) -> (Option<f64>, Option<f64>, Option<f64>) {
    if let Some(today) = daily.last() {
        return (Some(today.open), Some(today.high), Some(today.low));
    }
    let first = match intraday.first() {
        Some(bar) => bar,
        None => return (None, None, None),
    };
    let high = intraday.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = intraday.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    (Some(first.open), Some(high), Some(low))
}
