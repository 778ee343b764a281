//! End-to-end fan-out through the real hub and WebSocket endpoint

mod common;

use common::*;
use market_relay::protocol::{ClientMessage, ServerMessage, StatusState};
use market_relay::provider::{ProviderEvent, ProviderStatus, SessionCommand};
use market_relay::relay::HubConfig;
use market_relay::core::Provider;
use std::time::Duration;

fn package_request(symbol: &str) -> ClientMessage {
    ClientMessage::GetSymbolDataPackage {
        symbol: symbol.to_string(),
        provider: Provider::Stream,
        lookback_days: 0,
    }
}

/// Round-trip through the hub so every earlier message from `socket` is processed
async fn barrier(relay: &mut RelayHarness, socket: &mut ClientSocket, symbol: &str) {
    send(socket, &package_request(symbol)).await;
    assert!(matches!(
        relay.next_command().await,
        SessionCommand::RequestPackage { symbol: s, .. } if s == symbol
    ));
}

#[tokio::test]
async fn test_two_clients_share_one_upstream_subscription() {
    let mut relay = RelayHarness::start(HubConfig::default()).await;
    let key = stream_key("EURUSD");

    let mut alice = connect_client(&relay.url).await;
    let mut bob = connect_client(&relay.url).await;

    send(&mut alice, &ClientMessage::subscribe(&key, 5)).await;
    assert_eq!(relay.next_command().await, SessionCommand::Subscribe("EURUSD".into()));

    send(&mut bob, &ClientMessage::subscribe(&key, 5)).await;
    barrier(&mut relay, &mut bob, "BARRIER1").await;

    relay.emit(tick("EURUSD", 1.0850)).await;
    for socket in [&mut alice, &mut bob] {
        match next_message(socket).await {
            ServerMessage::Tick(t) => assert_eq!(t.bid, 1.0850),
            other => panic!("expected tick, got {:?}", other),
        }
    }

    // First leaver keeps the upstream alive
    send(&mut alice, &ClientMessage::unsubscribe(&key)).await;
    barrier(&mut relay, &mut alice, "BARRIER2").await;

    relay.emit(tick("EURUSD", 1.0851)).await;
    assert!(matches!(next_message(&mut bob).await, ServerMessage::Tick(_)));
    assert!(stays_silent(&mut alice, Duration::from_millis(200)).await);

    // Last leaver releases it
    send(&mut bob, &ClientMessage::unsubscribe(&key)).await;
    assert_eq!(relay.next_command().await, SessionCommand::Unsubscribe("EURUSD".into()));
}

#[tokio::test]
async fn test_concurrent_package_requests_share_one_upstream_request() {
    let mut relay = RelayHarness::start(HubConfig::default()).await;

    let mut alice = connect_client(&relay.url).await;
    let mut bob = connect_client(&relay.url).await;

    send(&mut alice, &package_request("GBPUSD")).await;
    assert_eq!(
        relay.next_command().await,
        SessionCommand::RequestPackage {
            symbol: "GBPUSD".into(),
            lookback_days: 30,
        }
    );
    send(&mut bob, &package_request("GBPUSD")).await;
    barrier(&mut relay, &mut bob, "BARRIER").await;

    for part in stream_parts("GBPUSD") {
        relay.emit(part).await;
    }
    for socket in [&mut alice, &mut bob] {
        match next_message(socket).await {
            ServerMessage::SymbolDataPackage(package) => {
                assert_eq!(package.symbol, "GBPUSD");
                assert_eq!(package.digits, Some(5));
                assert_eq!(package.history_bars.len(), 1);
                assert!(package.is_complete());
            }
            other => panic!("expected package, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_partial_package_is_degraded_after_deadline() {
    let mut relay = RelayHarness::start(HubConfig {
        coordinator_deadline: Duration::from_millis(200),
        ..HubConfig::default()
    })
    .await;
    let mut client = connect_client(&relay.url).await;

    send(&mut client, &package_request("USDJPY")).await;
    relay.next_command().await;

    let metadata_only = stream_parts("USDJPY").remove(0);
    relay.emit(metadata_only).await;

    match next_message(&mut client).await {
        ServerMessage::SymbolDataPackage(package) => {
            assert!(!package.is_complete());
            assert_eq!(package.digits, Some(5));
            assert!(package.history_bars.is_empty());
        }
        other => panic!("expected degraded package, got {:?}", other),
    }
}

#[tokio::test]
async fn test_provider_status_reaches_every_client() {
    let relay = RelayHarness::start(HubConfig::default()).await;
    let mut alice = connect_client(&relay.url).await;
    let mut bob = connect_client(&relay.url).await;

    relay
        .emit(ProviderEvent::Status {
            provider: Provider::Stream,
            status: ProviderStatus::Failed("authentication rejected".into()),
        })
        .await;

    for socket in [&mut alice, &mut bob] {
        match next_message(socket).await {
            ServerMessage::Status { state, provider, message, .. } => {
                assert_eq!(state, StatusState::Error);
                assert_eq!(provider, Some(Provider::Stream));
                assert_eq!(message.as_deref(), Some("authentication rejected"));
            }
            other => panic!("expected status, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_unknown_provider_gets_error() {
    let relay = RelayHarness::start(HubConfig::default()).await;
    let mut client = connect_client(&relay.url).await;

    let chart_key = market_relay::SubscriptionKey::new("EURUSD", Provider::Chart);
    send(&mut client, &ClientMessage::subscribe(&chart_key, 0)).await;

    match next_message(&mut client).await {
        ServerMessage::Error { symbol, provider, .. } => {
            assert_eq!(symbol, "EURUSD");
            assert_eq!(provider, Provider::Chart);
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let mut relay = RelayHarness::start(HubConfig::default()).await;
    let key = stream_key("AUDUSD");

    let mut client = connect_client(&relay.url).await;
    send(&mut client, &ClientMessage::subscribe(&key, 0)).await;
    assert_eq!(relay.next_command().await, SessionCommand::Subscribe("AUDUSD".into()));

    drop(client);
    assert_eq!(relay.next_command().await, SessionCommand::Unsubscribe("AUDUSD".into()));
}
