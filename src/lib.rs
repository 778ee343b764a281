//! Resilient market-data relay
//!
//! Keeps long-lived provider connections, multiplexes downstream subscriptions
//! onto them, and fans ticks and symbol data packages back out to clients.

pub mod client;
pub mod coordinator;
pub mod core;
pub mod health;
pub mod infrastructure;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod ws;

// Re-export commonly used types
pub use crate::core::{Provider, SubscriptionKey};
pub use infrastructure::config::Config;

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the relay server
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
