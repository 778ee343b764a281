//! WebSocket plumbing shared by provider sessions and the client

pub mod connection;
pub mod heartbeat;
pub mod reconnect;

pub use connection::{ConnectionState, Frame, WebSocketConnection, WebSocketError};
pub use heartbeat::{HeartbeatHealth, HeartbeatTracker};
pub use reconnect::{BackoffConfig, ReconnectionScheduler};
