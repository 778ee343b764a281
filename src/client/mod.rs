//! Relay client
//!
//! - state: subscription table and request queue
//! - manager: socket task, reconnect backoff, status channel
//! - basket: composite subscription with two-tier timeout

pub mod basket;
pub mod manager;
pub mod state;

pub use basket::{BasketState, BasketTimeouts, FxBasketStateMachine};
pub use manager::{ClientConfig, ConnectionManager, ConnectionStatus, SubscriptionHandle};
pub use state::{Callback, ClientState, RequestQueue};
