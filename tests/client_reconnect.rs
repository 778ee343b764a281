//! Connection manager against a scripted relay and against the real one

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use market_relay::client::{ClientConfig, ConnectionManager, ConnectionStatus};
use market_relay::core::{Provider, SymbolDataPackage};
use market_relay::protocol::{ClientMessage, ServerMessage, StatusState};
use market_relay::provider::SessionCommand;
use market_relay::relay::HubConfig;
use market_relay::ws::BackoffConfig;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type RelaySocket = WebSocketStream<TcpStream>;

fn client_config(url: String) -> ClientConfig {
    ClientConfig {
        url,
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffConfig {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
            max_attempts: 10,
        },
    }
}

async fn accept(listener: &TcpListener) -> RelaySocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn read_request(socket: &mut RelaySocket) -> ClientMessage {
    loop {
        let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            return ClientMessage::from_json(text.as_str()).unwrap();
        }
    }
}

async fn push(socket: &mut RelaySocket, message: &ServerMessage) {
    socket
        .send(Message::text(message.to_json().unwrap()))
        .await
        .unwrap();
}

fn package(symbol: &str, open: f64) -> ServerMessage {
    let key = stream_key(symbol);
    let mut package = SymbolDataPackage::assemble(&key, &HashMap::new(), Vec::new());
    package.open_price = Some(open);
    ServerMessage::SymbolDataPackage(package)
}

async fn wait_for(status: &mut watch::Receiver<ConnectionStatus>, wanted: ConnectionStatus) {
    timeout(WAIT, status.wait_for(|s| *s == wanted))
        .await
        .expect("status not reached")
        .unwrap();
}

#[tokio::test]
async fn test_resubscribes_after_relay_drops_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());

    let mut manager = ConnectionManager::new(client_config(url));
    let mut status = manager.watch_status();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _handle = manager.subscribe_and_request(
        "EURUSD",
        Provider::Stream,
        move |message: &ServerMessage| {
            let _ = seen_tx.send(message.clone());
        },
        5,
    );
    manager.connect();

    // First connection: queued requests flushed once
    let mut socket = accept(&listener).await;
    let key = stream_key("EURUSD");
    assert_eq!(read_request(&mut socket).await, ClientMessage::subscribe(&key, 5));
    assert!(matches!(
        read_request(&mut socket).await,
        ClientMessage::GetSymbolDataPackage { lookback_days: 5, .. }
    ));
    wait_for(&mut status, ConnectionStatus::Ready).await;

    push(&mut socket, &package("EURUSD", 1.0800)).await;
    match timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap() {
        ServerMessage::SymbolDataPackage(p) => assert_eq!(p.open_price, Some(1.0800)),
        other => panic!("expected package, got {:?}", other),
    }

    drop(socket);

    // Second connection: exactly one subscribe and one package request
    let mut socket = accept(&listener).await;
    assert_eq!(read_request(&mut socket).await, ClientMessage::subscribe(&key, 5));
    assert!(matches!(
        read_request(&mut socket).await,
        ClientMessage::GetSymbolDataPackage { .. }
    ));
    assert!(timeout(Duration::from_millis(200), socket.next()).await.is_err());

    push(&mut socket, &package("EURUSD", 1.0900)).await;
    match timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap() {
        ServerMessage::SymbolDataPackage(p) => assert_eq!(p.open_price, Some(1.0900)),
        other => panic!("expected fresh package, got {:?}", other),
    }
    assert_eq!(manager.subscriptions(), vec![key]);

    manager.close().await;
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_requests_made_while_ready_go_straight_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());

    let mut manager = ConnectionManager::new(client_config(url));
    let mut status = manager.watch_status();
    manager.connect();

    let mut socket = accept(&listener).await;
    wait_for(&mut status, ConnectionStatus::Ready).await;

    let handle = manager.subscribe_and_request("GBPUSD", Provider::Stream, |_: &ServerMessage| {}, 0);
    assert!(matches!(read_request(&mut socket).await, ClientMessage::Subscribe { .. }));
    assert!(matches!(
        read_request(&mut socket).await,
        ClientMessage::GetSymbolDataPackage { .. }
    ));

    handle.unsubscribe();
    assert_eq!(
        read_request(&mut socket).await,
        ClientMessage::unsubscribe(&stream_key("GBPUSD"))
    );
}

#[tokio::test]
async fn test_manager_through_real_relay() {
    let mut relay = RelayHarness::start(HubConfig::default()).await;

    let mut manager = ConnectionManager::new(client_config(relay.url.clone()));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _handle = manager.subscribe_and_request(
        "EURUSD",
        Provider::Stream,
        move |message: &ServerMessage| {
            let _ = seen_tx.send(message.clone());
        },
        0,
    );
    manager.connect();

    assert_eq!(relay.next_command().await, SessionCommand::Subscribe("EURUSD".into()));
    assert!(matches!(
        relay.next_command().await,
        SessionCommand::RequestPackage { lookback_days: 30, .. }
    ));

    for part in stream_parts("EURUSD") {
        relay.emit(part).await;
    }
    relay.emit(tick("EURUSD", 1.0852)).await;

    let mut got_package = false;
    let mut got_tick = false;
    while !(got_package && got_tick) {
        match timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap() {
            ServerMessage::SymbolDataPackage(p) => {
                assert!(p.is_complete());
                got_package = true;
            }
            ServerMessage::Tick(t) => {
                assert_eq!(t.bid, 1.0852);
                got_tick = true;
            }
            ServerMessage::Status { state, .. } => assert_ne!(state, StatusState::Error),
            other => panic!("unexpected {:?}", other),
        }
    }

    manager.close().await;
    assert_eq!(relay.next_command().await, SessionCommand::Unsubscribe("EURUSD".into()));
}
