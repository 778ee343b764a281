//! Relay server
//!
//! - hub: owner of registry, coordinator and health state
//! - server: per-client WebSocket tasks feeding the hub

pub mod hub;
pub mod server;

pub use crate::registry::ClientId;
pub use hub::{HubConfig, HubEvent, RelayHub, DEFAULT_LOOKBACK_DAYS};
pub use server::websocket_handler;
