//! Shared helpers for relay integration tests

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use market_relay::core::{Bar, PartPayload, PartType, Provider, SubscriptionKey, SymbolMetadata, Tick};
use market_relay::infrastructure::api::serve;
use market_relay::infrastructure::{AppState, RelayMetrics};
use market_relay::protocol::{ClientMessage, ServerMessage};
use market_relay::provider::{ProviderEvent, SessionCommand};
use market_relay::relay::{HubConfig, RelayHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Hub + server with a scripted stream provider in place of a supervisor
pub struct RelayHarness {
    pub url: String,
    pub provider: mpsc::Sender<ProviderEvent>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl RelayHarness {
    pub async fn start(config: HubConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let (client_tx, client_rx) = mpsc::channel(64);
        let (provider_tx, provider_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut hub = RelayHub::new(config, metrics.clone());
        hub.attach_provider(Provider::Stream, commands_tx);
        tokio::spawn(hub.run(client_rx, provider_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, AppState::new(client_tx, metrics)));

        Self {
            url: format!("ws://{}/ws", addr),
            provider: provider_tx,
            commands: commands_rx,
        }
    }

    pub async fn next_command(&mut self) -> SessionCommand {
        timeout(WAIT, self.commands.recv())
            .await
            .expect("no command within timeout")
            .expect("command channel closed")
    }

    pub async fn emit(&self, event: ProviderEvent) {
        self.provider.send(event).await.unwrap();
    }
}

/// Connect a raw client and consume the greeting status
pub async fn connect_client(url: &str) -> ClientSocket {
    let (mut socket, _) = connect_async(url).await.unwrap();
    match next_message(&mut socket).await {
        ServerMessage::Status { .. } => {}
        other => panic!("expected greeting status, got {:?}", other),
    }
    socket
}

pub async fn send(socket: &mut ClientSocket, message: &ClientMessage) {
    socket
        .send(Message::text(message.to_json().unwrap()))
        .await
        .unwrap();
}

pub async fn next_message(socket: &mut ClientSocket) -> ServerMessage {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("no message within timeout")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::from_json(text.as_str()).unwrap();
        }
    }
}

/// True if nothing arrives within `window`
pub async fn stays_silent(socket: &mut ClientSocket, window: Duration) -> bool {
    timeout(window, socket.next()).await.is_err()
}

pub fn stream_key(symbol: &str) -> SubscriptionKey {
    SubscriptionKey::new(symbol, Provider::Stream)
}

pub fn tick(symbol: &str, bid: f64) -> ProviderEvent {
    ProviderEvent::Tick(Tick {
        symbol: symbol.to_string(),
        provider: Provider::Stream,
        bid,
        ask: bid + 0.0002,
        timestamp: 1_700_000_000_000,
    })
}

/// Both parts a stream package needs
pub fn stream_parts(symbol: &str) -> Vec<ProviderEvent> {
    let key = stream_key(symbol);
    vec![
        ProviderEvent::Part {
            key: key.clone(),
            part: PartType::Metadata,
            payload: PartPayload::Metadata(SymbolMetadata::new(5, 4)),
        },
        ProviderEvent::Part {
            key,
            part: PartType::SeriesA,
            payload: PartPayload::Bars {
                bars: vec![Bar {
                    time: 1_700_000_000_000,
                    open: 1.0840,
                    high: 1.0875,
                    low: 1.0822,
                    close: 1.0851,
                    volume: 0.0,
                }],
                metadata: None,
            },
        },
    ]
}
