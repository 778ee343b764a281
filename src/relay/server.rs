//! Downstream WebSocket endpoint
//!
//! One task pair per client: the receive side parses `ClientMessage`s and
//! forwards them to the hub, the send side serializes whatever the hub queues
//! for this client. Either side ending tears the connection down.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::Level;

use crate::infrastructure::api::AppState;
use crate::log_relay;
use crate::protocol::{ClientMessage, ServerMessage, StatusState};
use crate::relay::HubEvent;

/// `GET /ws`
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client = state.next_client_id();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    if state
        .hub
        .send(HubEvent::Connected {
            client,
            outbound: outbound_tx.clone(),
        })
        .await
        .is_err()
    {
        log_relay!(Level::ERROR, client, "Hub is gone, refusing client");
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    log_relay!(Level::ERROR, client, "Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let hub = state.hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                    Ok(message) => {
                        if hub.send(HubEvent::Message { client, message }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_relay!(Level::WARN, client, "Invalid message: {}", e);
                        let _ = outbound_tx.send(ServerMessage::Status {
                            state: StatusState::Error,
                            symbol: None,
                            provider: None,
                            message: Some(e.to_string()),
                        });
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log_relay!(Level::WARN, client, "Receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let _ = state.hub.send(HubEvent::Disconnected { client }).await;
}
