//! HTTP surface
//!
//! Serves the downstream WebSocket at `/ws` and a metrics snapshot at
//! `/api/status`.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::infrastructure::metrics::{MetricsSnapshot, RelayMetrics};
use crate::registry::ClientId;
use crate::relay::{websocket_handler, HubEvent};
use crate::RelayError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: mpsc::Sender<HubEvent>,
    pub metrics: Arc<RelayMetrics>,
    next_client: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(hub: mpsc::Sender<HubEvent>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            hub,
            metrics,
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }
}

/// Response of `/api/status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDto {
    pub is_connected: bool,
    pub tick_age_ms: u64,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), RelayError> {
    axum::serve(listener, router(state)).await.map_err(RelayError::Io)
}

/// Bind `0.0.0.0:port` and serve
pub async fn start_server(state: AppState, port: u16) -> Result<(), RelayError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })?;
    tracing::info!("Relay listening on {}", addr);
    serve(listener, state).await
}

async fn get_status(State(state): State<AppState>) -> Json<StatusDto> {
    let metrics = state.metrics.snapshot();
    Json(StatusDto {
        is_connected: metrics.stream.connected || metrics.chart.connected,
        tick_age_ms: state.metrics.tick_age_ms(),
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Provider;

    #[test]
    fn test_client_ids_are_unique() {
        let (tx, _rx) = mpsc::channel(1);
        let state = AppState::new(tx, Arc::new(RelayMetrics::new()));
        let other = state.clone();
        assert_eq!(state.next_client_id(), 1);
        assert_eq!(other.next_client_id(), 2);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (tx, _rx) = mpsc::channel(1);
        let metrics = Arc::new(RelayMetrics::new());
        metrics.set_connected(Provider::Stream, true);
        metrics.record_tick(Provider::Stream);

        let Json(status) = get_status(State(AppState::new(tx, metrics))).await;
        assert!(status.is_connected);
        assert_eq!(status.metrics.stream.ticks, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isConnected"], true);
        assert_eq!(json["stream"]["ticks"], 1);
    }
}
