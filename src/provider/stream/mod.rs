//! Stream provider session
//!
//! Binary frames over a TLS WebSocket. The session authenticates the
//! application and then the account before accepting any subscription, sends a
//! heartbeat frame on a fixed interval, resolves symbol names to ids (filling
//! the metadata cache) and paces every request through a `PacedOutbox`.

pub mod codec;

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::Level;

use crate::core::{PartPayload, PartType, Provider, SubscriptionKey, SymbolMetadata, Tick};
use crate::provider::pacing::PacedOutbox;
use crate::provider::{
    epoch_millis, ProviderEvent, ProviderSession, SessionError, SessionState, RATE_LIMIT_CODE,
};
use crate::ws::{Frame, HeartbeatTracker, WebSocketConnection};
use crate::log_provider;

use codec::{payload_type, StreamFrame, StreamMessage, TrendbarPeriod, PRICE_SCALE};

const DAY_MS: u64 = 86_400_000;

/// Error codes that reject the credentials themselves
const AUTH_ERROR_CODES: [&str; 5] = [
    "CH_CLIENT_AUTH_FAILURE",
    "CH_CLIENT_NOT_AUTHENTICATED",
    "CH_ACCESS_TOKEN_INVALID",
    "OA_AUTH_TOKEN_EXPIRED",
    "ACCOUNT_NOT_AUTHORIZED",
];

fn handshake_error(code: &str, description: &str) -> SessionError {
    let detail = format!("{}: {}", code, description);
    if AUTH_ERROR_CODES.contains(&code) {
        SessionError::AuthRejected(detail)
    } else {
        SessionError::Transient(detail)
    }
}

/// Stream session settings
#[derive(Debug, Clone)]
pub struct StreamSessionConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub account_id: u64,
    pub access_token: String,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub max_requests: usize,
    pub window: Duration,
    pub connect_timeout: Duration,
}

impl Default for StreamSessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            account_id: 0,
            access_token: String::new(),
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
            max_requests: 5,
            window: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedSymbol {
    symbol_id: u64,
    metadata: SymbolMetadata,
}

/// Paced outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamRequest {
    Resolve { symbol: String },
    Subscribe { symbol: String, symbol_id: u64 },
    Unsubscribe { symbol: String, symbol_id: u64 },
    Trendbars { symbol: String, symbol_id: u64, lookback_days: u32 },
}

impl StreamRequest {
    fn symbol(&self) -> &str {
        match self {
            StreamRequest::Resolve { symbol }
            | StreamRequest::Subscribe { symbol, .. }
            | StreamRequest::Unsubscribe { symbol, .. }
            | StreamRequest::Trendbars { symbol, .. } => symbol,
        }
    }

    fn to_message(&self, account_id: u64, now_ms: u64) -> StreamMessage {
        match self {
            StreamRequest::Resolve { symbol } => StreamMessage::SymbolByNameReq {
                account_id,
                name: symbol.clone(),
            },
            StreamRequest::Subscribe { symbol_id, .. } => StreamMessage::SubscribeSpotsReq {
                account_id,
                symbol_id: *symbol_id,
            },
            StreamRequest::Unsubscribe { symbol_id, .. } => StreamMessage::UnsubscribeSpotsReq {
                account_id,
                symbol_id: *symbol_id,
            },
            StreamRequest::Trendbars {
                symbol_id,
                lookback_days,
                ..
            } => StreamMessage::GetTrendbarsReq {
                account_id,
                symbol_id: *symbol_id,
                from_ms: now_ms.saturating_sub(u64::from(*lookback_days) * DAY_MS),
                to_ms: now_ms,
                period: TrendbarPeriod::D1,
            },
        }
    }
}

/// Work waiting for a symbol id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    Subscribe,
    Package { lookback_days: u32 },
}

enum Wake {
    Frame(Result<Option<Frame>, crate::ws::WebSocketError>),
    Timer,
}

/// Stream provider session
pub struct StreamSession {
    config: StreamSessionConfig,
    conn: Option<WebSocketConnection>,
    state: SessionState,
    heartbeat: HeartbeatTracker,
    next_heartbeat: Instant,
    outbox: PacedOutbox<StreamRequest>,
    in_flight: HashMap<u32, StreamRequest>,
    next_request_id: u32,
    /// Encoded frames not yet confirmed written; survives a cancelled send
    write_queue: VecDeque<Bytes>,
    /// Metadata cache, never overwritten once filled
    symbols: HashMap<String, ResolvedSymbol>,
    names_by_id: HashMap<u64, String>,
    resolving: HashMap<String, Vec<Deferred>>,
    /// Symbols with live spot demand
    spots: HashSet<String>,
    /// Last full quote per symbol id; spot events carry only changed sides
    last_quote: HashMap<u64, (u64, u64)>,
    pending: VecDeque<ProviderEvent>,
}

impl StreamSession {
    pub fn new(config: StreamSessionConfig) -> Self {
        let now = Instant::now();
        Self {
            heartbeat: HeartbeatTracker::new(
                config.heartbeat_interval,
                config.max_missed_heartbeats,
                now,
            ),
            next_heartbeat: now + config.heartbeat_interval,
            outbox: PacedOutbox::new(config.max_requests, config.window),
            config,
            conn: None,
            state: SessionState::Disconnected,
            in_flight: HashMap::new(),
            next_request_id: 1,
            write_queue: VecDeque::new(),
            symbols: HashMap::new(),
            names_by_id: HashMap::new(),
            resolving: HashMap::new(),
            spots: HashSet::new(),
            last_quote: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Cached metadata for a resolved symbol
    pub fn metadata(&self, symbol: &str) -> Option<SymbolMetadata> {
        self.symbols.get(symbol).map(|s| s.metadata)
    }

    fn key(&self, symbol: &str) -> SubscriptionKey {
        SubscriptionKey::new(symbol, Provider::Stream)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// Drop per-connection state; the metadata cache survives
    fn drop_connection(&mut self) {
        self.conn = None;
        self.state = SessionState::Disconnected;
        self.outbox.clear();
        self.in_flight.clear();
        self.write_queue.clear();
        self.resolving.clear();
        self.spots.clear();
        self.last_quote.clear();
    }

    async fn flush_writes(&mut self) -> Result<(), SessionError> {
        while let Some(bytes) = self.write_queue.front().cloned() {
            let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
            conn.send_binary(bytes).await?;
            self.write_queue.pop_front();
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: StreamFrame) -> Result<(), SessionError> {
        self.write_queue.push_back(frame.encode());
        self.flush_writes().await
    }

    async fn send_request(&mut self, request: StreamRequest) -> Result<(), SessionError> {
        let id = self.next_id();
        let message = request.to_message(self.config.account_id, epoch_millis());
        log_provider!(Level::DEBUG, provider = "stream", request_id = id, "-> {:?}", message);
        self.in_flight.insert(id, request);
        self.send_frame(StreamFrame::new(id, message)).await
    }

    /// Wait for a handshake response of `expected` type
    async fn await_response(&mut self, expected: u16) -> Result<StreamMessage, SessionError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
            let frame = match timeout(deadline.saturating_duration_since(Instant::now()), conn.recv())
                .await
            {
                Ok(frame) => frame?,
                Err(_) => return Err(SessionError::Transient("handshake timed out".into())),
            };
            let data = match frame {
                Some(Frame::Binary(data)) => data,
                Some(Frame::Text(_)) => continue,
                None => return Err(SessionError::Closed),
            };
            let frame = StreamFrame::decode(&data).map_err(|e| SessionError::Codec(e.to_string()))?;
            match frame.message {
                StreamMessage::ErrorRes { code, description } => {
                    return Err(handshake_error(&code, &description));
                }
                message if message.payload_type() == expected => return Ok(message),
                _ => continue,
            }
        }
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let app = StreamMessage::AppAuthReq {
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        };
        let id = self.next_id();
        self.send_frame(StreamFrame::new(id, app)).await?;
        self.await_response(payload_type::APP_AUTH_RES).await?;

        let account = StreamMessage::AccountAuthReq {
            account_id: self.config.account_id,
            access_token: self.config.access_token.clone(),
        };
        let id = self.next_id();
        self.send_frame(StreamFrame::new(id, account)).await?;
        self.await_response(payload_type::ACCOUNT_AUTH_RES).await?;
        Ok(())
    }

    fn defer(&mut self, symbol: &str, work: Deferred) {
        let queue = self.resolving.entry(symbol.to_string()).or_insert_with(|| {
            self.outbox.push(StreamRequest::Resolve {
                symbol: symbol.to_string(),
            });
            Vec::new()
        });
        queue.push(work);
    }

    fn queue_package(&mut self, symbol: &str, resolved: ResolvedSymbol, lookback_days: u32) {
        self.pending.push_back(ProviderEvent::Part {
            key: self.key(symbol),
            part: PartType::Metadata,
            payload: PartPayload::Metadata(resolved.metadata),
        });
        self.outbox.push(StreamRequest::Trendbars {
            symbol: symbol.to_string(),
            symbol_id: resolved.symbol_id,
            lookback_days,
        });
    }

    fn handle_binary(&mut self, data: &[u8], now: Instant) {
        match StreamFrame::decode(data) {
            Ok(frame) => self.handle_message(frame.request_id, frame.message, now),
            Err(e) => {
                log_provider!(Level::WARN, provider = "stream", "Dropping undecodable frame: {}", e);
            }
        }
    }

    fn handle_message(&mut self, request_id: u32, message: StreamMessage, now: Instant) {
        match message {
            StreamMessage::Heartbeat => {}
            StreamMessage::SymbolByNameRes {
                symbol_id,
                name,
                digits,
                pip_position,
            } => {
                let symbol = match self.in_flight.remove(&request_id) {
                    Some(request) => request.symbol().to_string(),
                    None => name,
                };
                let resolved = *self.symbols.entry(symbol.clone()).or_insert(ResolvedSymbol {
                    symbol_id,
                    metadata: SymbolMetadata::new(u32::from(digits), u32::from(pip_position)),
                });
                self.names_by_id.insert(resolved.symbol_id, symbol.clone());

                for work in self.resolving.remove(&symbol).unwrap_or_default() {
                    match work {
                        Deferred::Subscribe if self.spots.contains(&symbol) => {
                            self.outbox.push(StreamRequest::Subscribe {
                                symbol: symbol.clone(),
                                symbol_id: resolved.symbol_id,
                            });
                        }
                        Deferred::Subscribe => {}
                        Deferred::Package { lookback_days } => {
                            self.queue_package(&symbol, resolved, lookback_days)
                        }
                    }
                }
            }
            StreamMessage::SubscribeSpotsRes | StreamMessage::UnsubscribeSpotsRes => {
                self.in_flight.remove(&request_id);
            }
            StreamMessage::SpotEvent {
                symbol_id,
                bid,
                ask,
                timestamp,
            } => {
                let symbol = match self.names_by_id.get(&symbol_id) {
                    Some(name) if self.spots.contains(name) => name.clone(),
                    _ => return,
                };
                let quote = self.last_quote.entry(symbol_id).or_insert((0, 0));
                if bid > 0 {
                    quote.0 = bid;
                }
                if ask > 0 {
                    quote.1 = ask;
                }
                if quote.0 == 0 || quote.1 == 0 {
                    return;
                }
                let (bid, ask) = *quote;
                self.pending.push_back(ProviderEvent::Tick(Tick {
                    symbol,
                    provider: Provider::Stream,
                    bid: bid as f64 / PRICE_SCALE,
                    ask: ask as f64 / PRICE_SCALE,
                    timestamp: if timestamp > 0 { timestamp } else { epoch_millis() },
                }));
            }
            StreamMessage::GetTrendbarsRes {
                symbol_id, bars, ..
            } => {
                let symbol = match self.in_flight.remove(&request_id) {
                    Some(request) => request.symbol().to_string(),
                    None => match self.names_by_id.get(&symbol_id) {
                        Some(name) => name.clone(),
                        None => return,
                    },
                };
                let metadata = self.metadata(&symbol);
                self.pending.push_back(ProviderEvent::Part {
                    key: self.key(&symbol),
                    part: PartType::SeriesA,
                    payload: PartPayload::Bars {
                        bars: bars.iter().map(|b| b.to_bar()).collect(),
                        metadata,
                    },
                });
            }
            StreamMessage::ErrorRes { code, description } => {
                let request = self.in_flight.remove(&request_id);
                if code == RATE_LIMIT_CODE {
                    log_provider!(
                        Level::WARN,
                        provider = "stream",
                        "Request {} rate limited, re-queued: {}",
                        request_id,
                        description
                    );
                    if let Some(request) = request {
                        self.outbox.requeue_after_rejection(request, now);
                    }
                    self.pending.push_back(ProviderEvent::RateLimited {
                        provider: Provider::Stream,
                        detail: description,
                    });
                    return;
                }

                log_provider!(
                    Level::WARN,
                    provider = "stream",
                    "Request {} failed: {} {}",
                    request_id,
                    code,
                    description
                );
                if let Some(StreamRequest::Resolve { symbol }) = request {
                    self.resolving.remove(&symbol);
                }
            }
            other => {
                log_provider!(Level::DEBUG, provider = "stream", "Ignoring {:?}", other);
            }
        }
    }

    async fn poll_event(&mut self) -> Result<ProviderEvent, SessionError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            self.flush_writes().await?;

            let now = Instant::now();
            if self.heartbeat.is_dead(now) {
                return Err(SessionError::HeartbeatTimeout(self.heartbeat.health(now).silent_for));
            }
            if now >= self.next_heartbeat {
                // Heartbeats bypass the pacer
                self.send_frame(StreamFrame::new(0, StreamMessage::Heartbeat)).await?;
                self.heartbeat.record_sent(now);
                self.next_heartbeat = now + self.heartbeat.interval();
                continue;
            }
            if let Some(request) = self.outbox.pop_due(now) {
                self.send_request(request).await?;
                continue;
            }

            let heartbeat_at = self.next_heartbeat;
            let dead_at = self.heartbeat.deadline();
            let outbox_due = self.outbox.next_due(now);
            let wake = {
                let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
                tokio::select! {
                    frame = conn.recv() => Wake::Frame(frame),
                    _ = sleep_until(heartbeat_at) => Wake::Timer,
                    _ = sleep_until(dead_at) => Wake::Timer,
                    _ = sleep_until(outbox_due.unwrap_or(dead_at)), if outbox_due.is_some() => Wake::Timer,
                }
            };

            match wake {
                Wake::Timer => {}
                Wake::Frame(Ok(Some(frame))) => {
                    let now = Instant::now();
                    self.heartbeat.record_inbound(now);
                    if let Frame::Binary(data) = frame {
                        self.handle_binary(&data, now);
                    }
                }
                Wake::Frame(Ok(None)) => return Err(SessionError::Closed),
                Wake::Frame(Err(e)) => return Err(e.into()),
            }
        }
    }
}

impl ProviderSession for StreamSession {
    fn provider(&self) -> Provider {
        Provider::Stream
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        self.drop_connection();
        self.state = SessionState::Connecting;
        log_provider!(Level::INFO, provider = "stream", "Connecting to {}", self.config.url);

        let conn = match WebSocketConnection::connect(&self.config.url, self.config.connect_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e.into());
            }
        };
        self.conn = Some(conn);
        self.state = SessionState::Authenticating;

        if let Err(e) = self.authenticate().await {
            log_provider!(Level::ERROR, provider = "stream", "Authentication failed: {}", e);
            self.drop_connection();
            return Err(e);
        }

        let now = Instant::now();
        self.heartbeat.reset(now);
        self.next_heartbeat = now + self.heartbeat.interval();
        self.state = SessionState::Ready;
        log_provider!(Level::INFO, provider = "stream", "Session ready");
        Ok(())
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        if !self.spots.insert(symbol.to_string()) {
            return Ok(());
        }
        match self.symbols.get(symbol) {
            Some(resolved) => self.outbox.push(StreamRequest::Subscribe {
                symbol: symbol.to_string(),
                symbol_id: resolved.symbol_id,
            }),
            None => self.defer(symbol, Deferred::Subscribe),
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, symbol: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        if !self.spots.remove(symbol) {
            return Ok(());
        }

        let queued = self.outbox.len();
        self.outbox.retain(|r| !matches!(r, StreamRequest::Subscribe { symbol: s, .. } if s == symbol));
        if let Some(work) = self.resolving.get_mut(symbol) {
            work.retain(|w| *w != Deferred::Subscribe);
        }
        if self.outbox.len() < queued {
            // Subscribe never left the queue
            return Ok(());
        }

        if let Some(resolved) = self.symbols.get(symbol).copied() {
            self.last_quote.remove(&resolved.symbol_id);
            self.outbox.push(StreamRequest::Unsubscribe {
                symbol: symbol.to_string(),
                symbol_id: resolved.symbol_id,
            });
        }
        Ok(())
    }

    async fn request_package(&mut self, symbol: &str, lookback_days: u32) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        let lookback_days = lookback_days.max(1);
        match self.symbols.get(symbol).copied() {
            Some(resolved) => self.queue_package(symbol, resolved, lookback_days),
            None => self.defer(symbol, Deferred::Package { lookback_days }),
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ProviderEvent, SessionError> {
        match self.poll_event().await {
            Ok(event) => Ok(event),
            Err(e) => {
                log_provider!(Level::WARN, provider = "stream", "Session lost: {}", e);
                self.drop_connection();
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.drop_connection();
    }
}
