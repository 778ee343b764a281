//! Composite subscription over a fixed symbol set
//!
//! A basket view subscribes to N symbols at once and needs its own two-tier
//! timeout on top of the per-key machinery:
//! - initialization: from `start`, fires if no symbol ever responds
//! - collection: from the first response, fires if coverage stays partial

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;

use crate::log_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasketState {
    Collecting,
    /// Every symbol responded
    Ready,
    /// Collection timed out with partial coverage
    Degraded,
    /// Initialization timed out with zero coverage
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct BasketTimeouts {
    pub initialization: Duration,
    pub collection: Duration,
}

impl Default for BasketTimeouts {
    fn default() -> Self {
        Self {
            initialization: Duration::from_secs(15),
            collection: Duration::from_secs(10),
        }
    }
}

pub struct FxBasketStateMachine {
    symbols: BTreeSet<String>,
    responded: BTreeSet<String>,
    timeouts: BasketTimeouts,
    state: BasketState,
    started_at: Option<Instant>,
    first_response_at: Option<Instant>,
}

impl FxBasketStateMachine {
    pub fn new<I, S>(symbols: I, timeouts: BasketTimeouts) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            responded: BTreeSet::new(),
            timeouts,
            state: BasketState::Collecting,
            started_at: None,
            first_response_at: None,
        }
    }

    /// Called when the subscription requests go out
    pub fn start(&mut self, now: Instant) {
        self.responded.clear();
        self.state = BasketState::Collecting;
        self.started_at = Some(now);
        self.first_response_at = None;
    }

    /// Record a symbol's first usable data; returns the new state on a transition
    pub fn on_symbol_ready(&mut self, symbol: &str, now: Instant) -> Option<BasketState> {
        if !self.symbols.contains(symbol) {
            return None;
        }
        if !matches!(self.state, BasketState::Collecting | BasketState::Degraded) {
            return None;
        }
        if !self.responded.insert(symbol.to_string()) {
            return None;
        }
        if self.first_response_at.is_none() {
            self.first_response_at = Some(now);
        }
        if self.responded.len() == self.symbols.len() {
            return self.transition(BasketState::Ready);
        }
        None
    }

    /// Fire whichever timeout has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<BasketState> {
        if self.state != BasketState::Collecting {
            return None;
        }
        let started_at = self.started_at?;
        match self.first_response_at {
            None if now >= started_at + self.timeouts.initialization => {
                self.transition(BasketState::Error)
            }
            Some(first) if now >= first + self.timeouts.collection => {
                self.transition(BasketState::Degraded)
            }
            _ => None,
        }
    }

    /// When `poll` should next be called
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != BasketState::Collecting {
            return None;
        }
        match self.first_response_at {
            Some(first) => Some(first + self.timeouts.collection),
            None => self.started_at.map(|s| s + self.timeouts.initialization),
        }
    }

    fn transition(&mut self, next: BasketState) -> Option<BasketState> {
        log_client!(
            Level::INFO,
            "Basket {:?} -> {:?} ({}/{} symbols)",
            self.state,
            next,
            self.responded.len(),
            self.symbols.len()
        );
        self.state = next;
        Some(next)
    }

    pub fn state(&self) -> BasketState {
        self.state
    }

    /// (responded, total)
    pub fn coverage(&self) -> (usize, usize) {
        (self.responded.len(), self.symbols.len())
    }

    pub fn missing(&self) -> Vec<String> {
        self.symbols.difference(&self.responded).cloned().collect()
    }
}
