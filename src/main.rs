//! Market-data relay
//!
//! # Architecture
//! - **provider**: one supervised session per upstream provider
//! - **relay**: hub task (registry, coordinator, health) + WebSocket server
//! - **infrastructure**: config, logging, metrics, status API

use anyhow::Context;
use market_relay::core::Provider;
use market_relay::infrastructure::logging::init_logging;
use market_relay::infrastructure::{start_server, AppState, RelayMetrics};
use market_relay::provider::{ChartSession, ProviderSupervisor, StreamSession};
use market_relay::relay::{HubConfig, RelayHub};
use market_relay::Config;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the hub's inbound channels
const HUB_CHANNEL_CAPACITY: usize = 1024;

/// Main application state
pub struct RelayApp {
    config: Config,
}

impl RelayApp {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Wire supervisors, hub and server, then serve until the server stops
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting market relay...");

        let metrics = Arc::new(RelayMetrics::new());
        let (client_tx, client_rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let (provider_tx, provider_rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let mut hub = RelayHub::new(HubConfig::from(&self.config), metrics.clone());
        let supervisor_config = self.config.supervisor();

        if self.config.stream.enabled {
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            hub.attach_provider(Provider::Stream, commands_tx);
            let session = StreamSession::new(self.config.stream_session());
            tokio::spawn(
                ProviderSupervisor::new(session, supervisor_config, commands_rx, provider_tx.clone()).run(),
            );
            tracing::info!("Stream provider enabled: {}", self.config.stream.url);
        }

        if self.config.chart.enabled {
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            hub.attach_provider(Provider::Chart, commands_tx);
            let session = ChartSession::new(self.config.chart_session());
            tokio::spawn(
                ProviderSupervisor::new(session, supervisor_config, commands_rx, provider_tx.clone()).run(),
            );
            tracing::info!("Chart provider enabled: {}", self.config.chart.url);
        }
        drop(provider_tx);

        let hub_task = tokio::spawn(hub.run(client_rx, provider_rx));

        let state = AppState::new(client_tx, metrics);
        start_server(state, self.config.server.port)
            .await
            .context("relay server failed")?;

        hub_task.await.context("hub task panicked")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    // Guards flush file writers on exit
    let _guards = init_logging(&config.logging).context("failed to initialize logging")?;

    RelayApp::new(config).run().await
}
