//! Upstream provider sessions
//!
//! One `ProviderSession` owns one physical connection to one provider and
//! speaks its wire protocol. Sessions never retry on their own: any failure
//! surfaces as `Err(SessionError)` and the `ProviderSupervisor` decides what
//! happens next.

pub mod chart;
pub mod pacing;
pub mod stream;
pub mod supervisor;

use std::future::Future;
use std::time::Duration;

use crate::core::{PartPayload, PartType, Provider, SubscriptionKey, Tick};
use crate::ws::WebSocketError;

pub use chart::ChartSession;
pub use pacing::{PacedOutbox, RequestPacer};
pub use stream::StreamSession;
pub use supervisor::{ProviderSupervisor, SupervisorConfig};

/// Error code a provider uses to reject a request burst
pub const RATE_LIMIT_CODE: &str = "REQUEST_FREQUENCY_EXCEEDED";

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

/// Why a session stopped
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("transient connection error: {0}")]
    Transient(String),
    #[error("no heartbeat from provider for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("session not ready")]
    NotReady,
    #[error("connection closed")]
    Closed,
}

impl SessionError {
    /// Permanent errors are not retried until new demand arrives
    pub fn is_permanent(&self) -> bool {
        matches!(self, SessionError::AuthRejected(_))
    }
}

impl From<WebSocketError> for SessionError {
    fn from(e: WebSocketError) -> Self {
        SessionError::Transient(e.to_string())
    }
}

/// Connection status of a provider as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Connecting,
    Connected,
    /// Auth rejected or reconnect attempts exhausted
    Failed(String),
}

/// Normalized event from a provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Tick(Tick),
    /// One piece of a symbol data package
    Part {
        key: SubscriptionKey,
        part: PartType,
        payload: PartPayload,
    },
    /// A request was rejected for frequency and has been re-queued
    RateLimited { provider: Provider, detail: String },
    Status {
        provider: Provider,
        status: ProviderStatus,
    },
    Disconnected { provider: Provider, reason: String },
}

/// Instruction from the relay to a provider supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Subscribe(String),
    Unsubscribe(String),
    RequestPackage { symbol: String, lookback_days: u32 },
}

/// Contract every provider adapter implements
///
/// `next_event` must be cancel safe: the supervisor drops it whenever a
/// command arrives, and no frame or queued request may be lost.
pub trait ProviderSession: Send {
    fn provider(&self) -> Provider;

    fn state(&self) -> SessionState;

    /// Open the connection and complete any handshake
    fn connect(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Start ticks for `symbol`; requires `Ready`
    fn subscribe(&mut self, symbol: &str) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn unsubscribe(&mut self, symbol: &str)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Ask for every part of the symbol's data package
    fn request_package(
        &mut self,
        symbol: &str,
        lookback_days: u32,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Next tick, part or rate-limit notice; `Err` means the session is down
    fn next_event(&mut self) -> impl Future<Output = Result<ProviderEvent, SessionError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Milliseconds since the Unix epoch
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
