//! Chart provider session
//!
//! `~m~`-framed JSON over WebSocket. Ticks come from a quote session shared by
//! all symbols. A package request opens a chart session with two series,
//! daily (`SeriesA`) and minute (`SeriesB`), which complete independently and
//! in any order; each completed series is emitted as its own part and the
//! coordinator decides when the symbol is ready.

pub mod codec;

use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::Level;
use uuid::Uuid;

use crate::core::{Bar, PartPayload, PartType, Provider, SubscriptionKey, SymbolMetadata, Tick};
use crate::provider::pacing::PacedOutbox;
use crate::provider::{epoch_millis, ProviderEvent, ProviderSession, SessionError, SessionState};
use crate::ws::{Frame, HeartbeatTracker, WebSocketConnection};
use crate::log_provider;

use codec::{encode_frame, encode_message, parse_payload, split_frames, ChartMessage};

const SERIES_A_ID: &str = "sds_1";
const SERIES_B_ID: &str = "sds_2";
const SYMBOL_ALIAS: &str = "sds_sym_1";

/// Chart session settings
#[derive(Debug, Clone)]
pub struct ChartSessionConfig {
    pub url: String,
    pub auth_token: String,
    /// Silence tolerated before the connection is declared dead
    pub heartbeat_timeout: Duration,
    pub max_requests: usize,
    pub window: Duration,
    pub connect_timeout: Duration,
    /// Minute bars requested for `SeriesB`
    pub intraday_bars: u32,
}

impl Default for ChartSessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: "unauthorized_user_token".to_string(),
            heartbeat_timeout: Duration::from_secs(30),
            max_requests: 5,
            window: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            intraday_bars: 1440,
        }
    }
}

/// Paced outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChartCall {
    AddQuote { symbol: String },
    RemoveQuote { symbol: String },
    CreateChart { chart: String },
    ResolveSymbol { chart: String, symbol: String },
    CreateSeries {
        chart: String,
        series_id: &'static str,
        resolution: &'static str,
        count: u32,
    },
    DeleteChart { chart: String },
}

impl ChartCall {
    fn encode(&self, quote_session: &str) -> String {
        match self {
            ChartCall::AddQuote { symbol } => {
                encode_message("quote_add_symbols", vec![json!(quote_session), json!(symbol)])
            }
            ChartCall::RemoveQuote { symbol } => {
                encode_message("quote_remove_symbols", vec![json!(quote_session), json!(symbol)])
            }
            ChartCall::CreateChart { chart } => {
                encode_message("chart_create_session", vec![json!(chart), json!("")])
            }
            ChartCall::ResolveSymbol { chart, symbol } => encode_message(
                "resolve_symbol",
                vec![
                    json!(chart),
                    json!(SYMBOL_ALIAS),
                    json!(format!("={}", json!({ "symbol": symbol, "adjustment": "splits" }))),
                ],
            ),
            ChartCall::CreateSeries {
                chart,
                series_id,
                resolution,
                count,
            } => encode_message(
                "create_series",
                vec![
                    json!(chart),
                    json!(series_id),
                    json!(format!("s{}", &series_id[series_id.len() - 1..])),
                    json!(SYMBOL_ALIAS),
                    json!(resolution),
                    json!(count),
                ],
            ),
            ChartCall::DeleteChart { chart } => {
                encode_message("chart_delete_session", vec![json!(chart)])
            }
        }
    }
}

fn series_part(series_id: &str) -> Option<PartType> {
    match series_id {
        SERIES_A_ID => Some(PartType::SeriesA),
        SERIES_B_ID => Some(PartType::SeriesB),
        _ => None,
    }
}

/// Bars accumulating for one chart session
#[derive(Debug, Default)]
struct SeriesBuffer {
    symbol: String,
    /// Keyed by bar time so streaming updates replace the forming bar
    bars: HashMap<PartType, BTreeMap<u64, Bar>>,
    completed: HashSet<PartType>,
}

enum Wake {
    Frame(Result<Option<Frame>, crate::ws::WebSocketError>),
    Timer,
}

/// Chart provider session
pub struct ChartSession {
    config: ChartSessionConfig,
    conn: Option<WebSocketConnection>,
    state: SessionState,
    heartbeat: HeartbeatTracker,
    outbox: PacedOutbox<ChartCall>,
    write_queue: VecDeque<String>,
    quote_session: String,
    charts: HashMap<String, SeriesBuffer>,
    /// Metadata cache, never overwritten once filled
    metadata: HashMap<String, SymbolMetadata>,
    quotes: HashSet<String>,
    last_quote: HashMap<String, (Option<f64>, Option<f64>)>,
    pending: VecDeque<ProviderEvent>,
}

fn session_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..12])
}

impl ChartSession {
    pub fn new(config: ChartSessionConfig) -> Self {
        Self {
            heartbeat: HeartbeatTracker::new(config.heartbeat_timeout, 1, Instant::now()),
            outbox: PacedOutbox::new(config.max_requests, config.window),
            config,
            conn: None,
            state: SessionState::Disconnected,
            write_queue: VecDeque::new(),
            quote_session: session_id("qs"),
            charts: HashMap::new(),
            metadata: HashMap::new(),
            quotes: HashSet::new(),
            last_quote: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn metadata(&self, symbol: &str) -> Option<SymbolMetadata> {
        self.metadata.get(symbol).copied()
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.state = SessionState::Disconnected;
        self.outbox.clear();
        self.write_queue.clear();
        self.charts.clear();
        self.quotes.clear();
        self.last_quote.clear();
    }

    async fn flush_writes(&mut self) -> Result<(), SessionError> {
        while let Some(text) = self.write_queue.front().cloned() {
            let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
            conn.send_text(text).await?;
            self.write_queue.pop_front();
        }
        Ok(())
    }

    async fn send_now(&mut self, text: String) -> Result<(), SessionError> {
        self.write_queue.push_back(text);
        self.flush_writes().await
    }

    /// Wait for the first server frame after the handshake
    ///
    /// A protocol error before anything else means the token was refused.
    async fn await_first_frame(&mut self) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let frame = {
                let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
                match timeout(deadline.saturating_duration_since(Instant::now()), conn.recv()).await {
                    Ok(frame) => frame?,
                    Err(_) => return Err(SessionError::Transient("no server greeting".into())),
                }
            };
            let text = match frame {
                Some(Frame::Text(text)) => text,
                Some(Frame::Binary(_)) => continue,
                None => return Err(SessionError::Closed),
            };
            let payloads = split_frames(&text).map_err(|e| SessionError::Codec(e.to_string()))?;
            for payload in payloads {
                match parse_payload(payload) {
                    ChartMessage::CriticalError(reason) => return Err(SessionError::AuthRejected(reason)),
                    message => self.handle_message(message)?,
                }
            }
            return Ok(());
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<(), SessionError> {
        let payloads = match split_frames(text) {
            Ok(payloads) => payloads,
            Err(e) => {
                log_provider!(Level::WARN, provider = "chart", "Dropping malformed message: {}", e);
                return Ok(());
            }
        };
        for payload in payloads {
            self.handle_message(parse_payload(payload))?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ChartMessage) -> Result<(), SessionError> {
        match message {
            ChartMessage::Heartbeat(beat) => {
                // Echo bypasses the pacer
                self.write_queue.push_back(encode_frame(&beat));
            }
            ChartMessage::SymbolResolved {
                session,
                price_scale,
            } => {
                if let Some(buffer) = self.charts.get(&session) {
                    self.metadata
                        .entry(buffer.symbol.clone())
                        .or_insert_with(|| SymbolMetadata::from_price_scale(price_scale));
                }
            }
            ChartMessage::SeriesData { session, series } => {
                let buffer = match self.charts.get_mut(&session) {
                    Some(buffer) => buffer,
                    None => return Ok(()),
                };
                for (series_id, bars) in series {
                    let part = match series_part(&series_id) {
                        Some(part) if !buffer.completed.contains(&part) => part,
                        _ => continue,
                    };
                    let slot = buffer.bars.entry(part).or_default();
                    for bar in bars {
                        slot.insert(bar.time, bar);
                    }
                }
            }
            ChartMessage::SeriesCompleted { session, series_id } => {
                self.complete_series(&session, &series_id);
            }
            ChartMessage::Quote { symbol, bid, ask } => {
                if !self.quotes.contains(&symbol) {
                    return Ok(());
                }
                let quote = self.last_quote.entry(symbol.clone()).or_insert((None, None));
                if bid.is_some() {
                    quote.0 = bid;
                }
                if ask.is_some() {
                    quote.1 = ask;
                }
                if let (Some(bid), Some(ask)) = *quote {
                    self.pending.push_back(ProviderEvent::Tick(Tick {
                        symbol,
                        provider: Provider::Chart,
                        bid,
                        ask,
                        timestamp: epoch_millis(),
                    }));
                }
            }
            ChartMessage::SymbolError { session, reason } => {
                if let Some(buffer) = self.charts.remove(&session) {
                    log_provider!(
                        Level::WARN,
                        provider = "chart",
                        "Symbol {} failed: {}",
                        buffer.symbol,
                        reason
                    );
                    self.outbox.push(ChartCall::DeleteChart { chart: session });
                }
            }
            ChartMessage::CriticalError(reason) => return Err(SessionError::Transient(reason)),
            ChartMessage::Other(method) => {
                log_provider!(Level::TRACE, provider = "chart", "Ignoring {}", method);
            }
        }
        Ok(())
    }

    fn complete_series(&mut self, session: &str, series_id: &str) {
        let part = match series_part(series_id) {
            Some(part) => part,
            None => return,
        };
        let buffer = match self.charts.get_mut(session) {
            Some(buffer) => buffer,
            None => return,
        };
        if !buffer.completed.insert(part) {
            return;
        }

        let bars: Vec<Bar> = buffer
            .bars
            .remove(&part)
            .map(|slot| slot.into_values().collect())
            .unwrap_or_default();
        let symbol = buffer.symbol.clone();
        let done = buffer.completed.len() == Provider::Chart.required_parts().len();

        self.pending.push_back(ProviderEvent::Part {
            key: SubscriptionKey::new(symbol.as_str(), Provider::Chart),
            part,
            payload: PartPayload::Bars {
                bars,
                metadata: self.metadata.get(&symbol).copied(),
            },
        });

        if done {
            self.charts.remove(session);
            self.outbox.push(ChartCall::DeleteChart {
                chart: session.to_string(),
            });
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
            if let Some(call) = self.outbox.pop_due(now) {
                let text = call.encode(&self.quote_session);
                log_provider!(Level::DEBUG, provider = "chart", "-> {:?}", call);
                self.send_now(text).await?;
                continue;
            }

            let dead_at = self.heartbeat.deadline();
            let outbox_due = self.outbox.next_due(now);
            let wake = {
                let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
                tokio::select! {
                    frame = conn.recv() => Wake::Frame(frame),
                    _ = sleep_until(dead_at) => Wake::Timer,
                    _ = sleep_until(outbox_due.unwrap_or(dead_at)), if outbox_due.is_some() => Wake::Timer,
                }
            };

            match wake {
                Wake::Timer => {}
                Wake::Frame(Ok(Some(frame))) => {
                    self.heartbeat.record_inbound(Instant::now());
                    if let Frame::Text(text) = frame {
                        self.handle_text(&text)?;
                    }
                }
                Wake::Frame(Ok(None)) => return Err(SessionError::Closed),
                Wake::Frame(Err(e)) => return Err(e.into()),
            }
        }
    }
}

impl ProviderSession for ChartSession {
    fn provider(&self) -> Provider {
        Provider::Chart
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        self.drop_connection();
        self.state = SessionState::Connecting;
        log_provider!(Level::INFO, provider = "chart", "Connecting to {}", self.config.url);

        let conn = match WebSocketConnection::connect(&self.config.url, self.config.connect_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e.into());
            }
        };
        self.conn = Some(conn);
        self.state = SessionState::Authenticating;
        self.quote_session = session_id("qs");

        let handshake = [
            encode_message("set_auth_token", vec![json!(self.config.auth_token)]),
            encode_message("quote_create_session", vec![json!(self.quote_session)]),
            encode_message(
                "quote_set_fields",
                vec![json!(self.quote_session), json!("bid"), json!("ask")],
            ),
        ];
        for text in handshake {
            if let Err(e) = self.send_now(text).await {
                self.drop_connection();
                return Err(e);
            }
        }
        if let Err(e) = self.await_first_frame().await {
            log_provider!(Level::ERROR, provider = "chart", "Handshake failed: {}", e);
            self.drop_connection();
            return Err(e);
        }

        self.heartbeat.reset(Instant::now());
        self.state = SessionState::Ready;
        log_provider!(Level::INFO, provider = "chart", "Session ready");
        Ok(())
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        if self.quotes.insert(symbol.to_string()) {
            self.outbox.push(ChartCall::AddQuote {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, symbol: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        if !self.quotes.remove(symbol) {
            return Ok(());
        }
        self.last_quote.remove(symbol);

        let queued = self.outbox.len();
        self.outbox.retain(|c| !matches!(c, ChartCall::AddQuote { symbol: s } if s == symbol));
        if self.outbox.len() == queued {
            self.outbox.push(ChartCall::RemoveQuote {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }

    async fn request_package(&mut self, symbol: &str, lookback_days: u32) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        if self.charts.values().any(|b| b.symbol == symbol) {
            return Ok(());
        }

        let chart = session_id("cs");
        self.charts.insert(
            chart.clone(),
            SeriesBuffer {
                symbol: symbol.to_string(),
                ..Default::default()
            },
        );
        self.outbox.push(ChartCall::CreateChart { chart: chart.clone() });
        self.outbox.push(ChartCall::ResolveSymbol {
            chart: chart.clone(),
            symbol: symbol.to_string(),
        });
        self.outbox.push(ChartCall::CreateSeries {
            chart: chart.clone(),
            series_id: SERIES_A_ID,
            resolution: "1D",
            count: lookback_days.max(1),
        });
        self.outbox.push(ChartCall::CreateSeries {
            chart,
            series_id: SERIES_B_ID,
            resolution: "1",
            count: self.config.intraday_bars,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ProviderEvent, SessionError> {
        match self.poll_event().await {
            Ok(event) => Ok(event),
            Err(e) => {
                log_provider!(Level::WARN, provider = "chart", "Session lost: {}", e);
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
