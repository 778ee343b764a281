//! Client connection manager
//!
//! Owns the single WebSocket connection from a consuming application to the
//! relay. Callers register callbacks per `(symbol, provider)`; the manager
//! keeps those registrations across reconnects, replays them whenever the
//! connection becomes ready again, and publishes its state on a watch
//! channel.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Level;

use crate::client::state::{Callback, ClientState};
use crate::core::{Provider, SubscriptionKey};
use crate::log_client;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::ws::{BackoffConfig, Frame, ReconnectionScheduler, WebSocketConnection};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Ready,
    /// Waiting before retry number `attempt`
    Reconnecting { attempt: u32 },
    /// Attempts exhausted; only an explicit `connect` retries
    Failed,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub url: String,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

struct Shared {
    state: Mutex<ClientState>,
    status: watch::Sender<ConnectionStatus>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        log_client!(Level::DEBUG, "Status {:?}", status);
        self.status.send_replace(status);
    }

    /// Invoke callbacks outside the lock so they may call back into the manager
    fn dispatch(&self, message: &ServerMessage) {
        let callbacks = self.state.lock().callbacks_for(message);
        for callback in callbacks {
            callback(message);
        }
    }
}

/// Returned by `subscribe_and_request`; `unsubscribe` removes the callback
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    id: u64,
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn unsubscribe(self) {
        self.shared.state.lock().unsubscribe(&self.key, self.id);
    }
}

pub struct ConnectionManager {
    config: ClientConfig,
    shared: Arc<Shared>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState::new()),
                status,
            }),
            shutdown: None,
            task: None,
        }
    }

    /// Start the connection task
    ///
    /// No-op while a task is running; restarts after `Failed`.
    pub fn connect(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run(
            self.shared.clone(),
            self.config.clone(),
            shutdown_rx,
        )));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Register `callback` for `(symbol, provider)` and request its package
    ///
    /// Works in any state; requests made before the connection is ready are
    /// queued.
    pub fn subscribe_and_request<F>(
        &self,
        symbol: impl Into<String>,
        provider: Provider,
        callback: F,
        history_depth: u32,
    ) -> SubscriptionHandle
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::new(symbol, provider);
        let callback: Callback = Arc::new(callback);
        let id = self
            .shared
            .state
            .lock()
            .subscribe(key.clone(), callback, history_depth);
        SubscriptionHandle {
            key,
            id,
            shared: self.shared.clone(),
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.shared.state.lock().keys()
    }

    /// Stop the connection task; subscriptions are kept
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.shared.state.lock().on_close();
        self.shared.set_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(shared: Arc<Shared>, config: ClientConfig, mut shutdown: watch::Receiver<bool>) {
    let mut scheduler = ReconnectionScheduler::new(config.backoff);

    loop {
        if scheduler.attempt() == 0 {
            shared.set_status(ConnectionStatus::Connecting);
        }
        match WebSocketConnection::connect(&config.url, config.connect_timeout).await {
            Ok(connection) => {
                log_client!(Level::INFO, "Connected to {}", config.url);
                scheduler.reset();
                let (tx, rx) = mpsc::unbounded_channel();
                shared.state.lock().on_open(tx);
                shared.set_status(ConnectionStatus::Ready);

                let reason = pump(&shared, connection, rx, &mut shutdown).await;
                shared.state.lock().on_close();
                match reason {
                    Some(reason) => log_client!(Level::WARN, "Connection lost: {}", reason),
                    None => return,
                }
            }
            Err(e) => log_client!(Level::WARN, "Connect to {} failed: {}", config.url, e),
        }

        let delay = match scheduler.next_delay() {
            Some(delay) => delay,
            None => {
                log_client!(Level::ERROR, "Giving up after {} attempts", scheduler.attempt());
                shared.set_status(ConnectionStatus::Failed);
                return;
            }
        };
        shared.set_status(ConnectionStatus::Reconnecting {
            attempt: scheduler.attempt(),
        });
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Move frames until the socket dies; `None` means shutdown was requested
async fn pump(
    shared: &Shared,
    mut connection: WebSocketConnection,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<String> {
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Some("request channel closed".to_string());
                };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        log_client!(Level::ERROR, "Failed to encode {:?}: {}", message, e);
                        continue;
                    }
                };
                if let Err(e) = connection.send_text(json).await {
                    return Some(e.to_string());
                }
            }
            frame = connection.recv() => match frame {
                Ok(Some(Frame::Text(text))) => match ServerMessage::from_json(&text) {
                    Ok(message) => shared.dispatch(&message),
                    Err(e) => log_client!(Level::WARN, "Ignoring message: {}", e),
                },
                Ok(Some(Frame::Binary(_))) => {}
                Ok(None) => return Some("closed by relay".to_string()),
                Err(e) => return Some(e.to_string()),
            },
            _ = shutdown.changed() => {
                connection.close().await;
                return None;
            }
        }
    }
}
