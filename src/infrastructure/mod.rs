//! Infrastructure
//!
//! Everything around the data path:
//! - Configuration and logging
//! - Metrics and the HTTP surface

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;

pub use api::{start_server, AppState};
pub use metrics::RelayMetrics;
