//! Relay hub
//!
//! Single owner of the subscription registry, the message coordinator and the
//! health monitor. Client connections and provider supervisors talk to it
//! only through channels; every map is mutated inside one task, so per-key
//! ordering is the order in which provider events arrive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::Level;

use crate::coordinator::{MessageCoordinator, PartOutcome};
use crate::core::{Provider, SubscriptionKey, SymbolDataPackage};
use crate::health::{HealthEvent, HealthMonitor};
use crate::infrastructure::config::Config;
use crate::infrastructure::metrics::RelayMetrics;
use crate::log_relay;
use crate::protocol::{ClientMessage, ServerMessage, StatusState};
use crate::provider::{ProviderEvent, ProviderStatus, SessionCommand};
use crate::registry::{ClientId, SubscriptionRegistry, UpstreamAction};

/// Lookback used when a client does not ask for one
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

/// Input from a downstream connection task
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        client: ClientId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        client: ClientId,
        message: ClientMessage,
    },
    Disconnected {
        client: ClientId,
    },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub coordinator_deadline: Duration,
    pub stale_threshold: Duration,
    pub health_check_interval: Duration,
    pub resubscribe_on_stale: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            coordinator_deadline: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            resubscribe_on_stale: false,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            coordinator_deadline: config.coordinator_deadline(),
            stale_threshold: Duration::from_secs(config.health.stale_threshold_secs),
            health_check_interval: Duration::from_secs(config.health.check_interval_secs),
            resubscribe_on_stale: config.health.resubscribe_on_stale,
        }
    }
}

pub struct RelayHub {
    config: HubConfig,
    registry: SubscriptionRegistry,
    coordinator: MessageCoordinator,
    health: HealthMonitor,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    /// Clients waiting for a symbol data package
    waiters: HashMap<SubscriptionKey, HashSet<ClientId>>,
    providers: HashMap<Provider, mpsc::UnboundedSender<SessionCommand>>,
    metrics: Arc<RelayMetrics>,
}

impl RelayHub {
    pub fn new(config: HubConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            coordinator: MessageCoordinator::new(config.coordinator_deadline),
            health: HealthMonitor::new(config.stale_threshold),
            clients: HashMap::new(),
            waiters: HashMap::new(),
            providers: HashMap::new(),
            metrics,
            config,
        }
    }

    /// Route commands for `provider` to its supervisor
    pub fn attach_provider(&mut self, provider: Provider, commands: mpsc::UnboundedSender<SessionCommand>) {
        self.providers.insert(provider, commands);
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.coordinator.next_deadline()
    }

    /// Run until every client sender is dropped
    pub async fn run(
        mut self,
        mut client_events: mpsc::Receiver<HubEvent>,
        mut provider_events: mpsc::Receiver<ProviderEvent>,
    ) {
        let mut health_check = interval(self.config.health_check_interval);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut providers_open = true;

        log_relay!(Level::INFO, "Hub running with {} providers", self.providers.len());

        loop {
            let deadline = self.coordinator.next_deadline();
            tokio::select! {
                event = client_events.recv() => match event {
                    Some(event) => self.handle_client_event(event, Instant::now()),
                    None => break,
                },
                event = provider_events.recv(), if providers_open => match event {
                    Some(event) => self.handle_provider_event(event, Instant::now()),
                    None => {
                        log_relay!(Level::WARN, "All provider supervisors stopped");
                        providers_open = false;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline(Instant::now());
                }
                _ = health_check.tick() => self.on_health_check(Instant::now()),
            }
        }

        log_relay!(Level::INFO, "Hub stopped");
    }

    pub fn handle_client_event(&mut self, event: HubEvent, now: Instant) {
        match event {
            HubEvent::Connected { client, outbound } => {
                log_relay!(Level::INFO, client, "Client connected");
                let _ = outbound.send(ServerMessage::status(StatusState::Connected));
                self.clients.insert(client, outbound);
                self.metrics.client_connected();
            }
            HubEvent::Message { client, message } => self.handle_client_message(client, message, now),
            HubEvent::Disconnected { client } => self.release_client(client),
        }
    }

    fn handle_client_message(&mut self, client: ClientId, message: ClientMessage, now: Instant) {
        let key = message.key();
        if !self.providers.contains_key(&key.provider) {
            self.send_to(
                client,
                ServerMessage::Error {
                    symbol: key.symbol.clone(),
                    provider: key.provider,
                    message: format!("provider {} is not available", key.provider),
                    missing_parts: Vec::new(),
                },
            );
            return;
        }

        match message {
            ClientMessage::Subscribe { history_depth, .. } => {
                log_relay!(Level::DEBUG, client, key = %key, "Subscribe");
                if let Some(UpstreamAction::Subscribe(key)) = self.registry.subscribe(client, key, history_depth) {
                    self.health.track(key.clone(), now);
                    self.send_command(key.provider, SessionCommand::Subscribe(key.symbol));
                }
            }
            ClientMessage::Unsubscribe { .. } => {
                log_relay!(Level::DEBUG, client, key = %key, "Unsubscribe");
                if let Some(action) = self.registry.unsubscribe(client, &key) {
                    self.apply_upstream(action);
                }
            }
            ClientMessage::GetSymbolDataPackage { lookback_days, .. } => {
                let lookback_days = if lookback_days == 0 {
                    DEFAULT_LOOKBACK_DAYS
                } else {
                    lookback_days
                };
                self.waiters.entry(key.clone()).or_default().insert(client);
                if self.coordinator.begin(key.clone(), key.provider.required_parts(), now) {
                    self.send_command(
                        key.provider,
                        SessionCommand::RequestPackage {
                            symbol: key.symbol,
                            lookback_days,
                        },
                    );
                }
            }
        }
        self.metrics.set_key_counts(self.registry.len(), self.health.stale_count());
    }

    fn release_client(&mut self, client: ClientId) {
        log_relay!(Level::INFO, client, "Client disconnected");
        self.clients.remove(&client);
        self.metrics.client_disconnected();

        for action in self.registry.release_client(client) {
            self.apply_upstream(action);
        }

        let abandoned: Vec<SubscriptionKey> = self
            .waiters
            .iter_mut()
            .filter_map(|(key, clients)| {
                clients.remove(&client);
                clients.is_empty().then(|| key.clone())
            })
            .collect();
        for key in abandoned {
            self.waiters.remove(&key);
            self.coordinator.cancel(&key);
        }
        self.metrics.set_key_counts(self.registry.len(), self.health.stale_count());
    }

    fn apply_upstream(&mut self, action: UpstreamAction) {
        match action {
            UpstreamAction::Subscribe(key) => {
                self.send_command(key.provider, SessionCommand::Subscribe(key.symbol));
            }
            UpstreamAction::Unsubscribe(key) => {
                self.health.untrack(&key);
                self.send_command(key.provider, SessionCommand::Unsubscribe(key.symbol));
            }
        }
    }

    pub fn handle_provider_event(&mut self, event: ProviderEvent, now: Instant) {
        match event {
            ProviderEvent::Tick(tick) => {
                let key = tick.key();
                self.metrics.record_tick(key.provider);
                self.record_activity(&key, now);
                self.broadcast(&key, ServerMessage::Tick(tick));
            }
            ProviderEvent::Part { key, part, payload } => {
                self.record_activity(&key, now);
                match self.coordinator.on_part(&key, part, payload, now) {
                    PartOutcome::Combined(package) => self.deliver_package(&key, package),
                    PartOutcome::Pending | PartOutcome::Discarded => {}
                }
            }
            ProviderEvent::RateLimited { provider, detail } => {
                log_relay!(Level::WARN, provider = %provider, "Request paced after rejection: {}", detail);
                self.metrics.record_rate_limited(provider);
            }
            ProviderEvent::Status { provider, status } => {
                let (state, message) = match status {
                    ProviderStatus::Connecting => (StatusState::Connecting, None),
                    ProviderStatus::Connected => {
                        self.metrics.set_connected(provider, true);
                        (StatusState::Connected, None)
                    }
                    ProviderStatus::Failed(reason) => {
                        log_relay!(Level::ERROR, provider = %provider, "Provider failed: {}", reason);
                        self.metrics.set_connected(provider, false);
                        (StatusState::Error, Some(reason))
                    }
                };
                self.broadcast_provider_status(provider, state, message);
            }
            ProviderEvent::Disconnected { provider, reason } => {
                self.metrics.record_disconnect(provider);
                self.broadcast_provider_status(provider, StatusState::Connecting, Some(reason));
            }
        }
    }

    fn record_activity(&mut self, key: &SubscriptionKey, now: Instant) {
        if let Some(HealthEvent::Resumed { key }) = self.health.record_activity(key, now) {
            self.broadcast(&key, ServerMessage::key_status(&key, StatusState::Resumed));
        }
    }

    fn deliver_package(&mut self, key: &SubscriptionKey, package: SymbolDataPackage) {
        let waiters = self.waiters.remove(key).unwrap_or_default();
        log_relay!(
            Level::INFO,
            key = %key,
            complete = package.is_complete(),
            "Delivering package to {} clients",
            waiters.len()
        );
        self.metrics.record_package(!package.is_complete());
        for client in waiters {
            self.send_to(client, ServerMessage::SymbolDataPackage(package.clone()));
        }
    }

    /// Fire every expired coordinator deadline
    pub fn on_deadline(&mut self, now: Instant) {
        for timeout in self.coordinator.expire(now) {
            self.metrics.record_timeout();
            match timeout.partial {
                Some(package) => self.deliver_package(&timeout.key, package),
                None => {
                    let waiters = self.waiters.remove(&timeout.key).unwrap_or_default();
                    let message = ServerMessage::Error {
                        symbol: timeout.key.symbol.clone(),
                        provider: timeout.key.provider,
                        message: format!(
                            "no data within {}s",
                            self.config.coordinator_deadline.as_secs()
                        ),
                        missing_parts: timeout.missing_parts,
                    };
                    for client in waiters {
                        self.send_to(client, message.clone());
                    }
                }
            }
        }
    }

    pub fn on_health_check(&mut self, now: Instant) {
        for event in self.health.check_staleness(now) {
            if let HealthEvent::Stale { key, .. } = event {
                self.broadcast(&key, ServerMessage::key_status(&key, StatusState::Stale));
                if self.config.resubscribe_on_stale {
                    log_relay!(Level::INFO, key = %key, "Forcing resubscribe for stale key");
                    self.send_command(key.provider, SessionCommand::Unsubscribe(key.symbol.clone()));
                    self.send_command(key.provider, SessionCommand::Subscribe(key.symbol.clone()));
                }
            }
        }
        self.metrics.set_key_counts(self.registry.len(), self.health.stale_count());
    }

    fn send_command(&self, provider: Provider, command: SessionCommand) {
        match self.providers.get(&provider) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    log_relay!(Level::ERROR, provider = %provider, "Supervisor is gone");
                }
            }
            None => log_relay!(Level::WARN, provider = %provider, "No supervisor for {:?}", command),
        }
    }

    fn send_to(&self, client: ClientId, message: ServerMessage) {
        if let Some(tx) = self.clients.get(&client) {
            // Closed channel: the Disconnected event is on its way
            let _ = tx.send(message);
        }
    }

    fn broadcast(&self, key: &SubscriptionKey, message: ServerMessage) {
        for client in self.registry.clients(key) {
            self.send_to(client, message.clone());
        }
    }

    fn broadcast_provider_status(&self, provider: Provider, state: StatusState, message: Option<String>) {
        let status = ServerMessage::Status {
            state,
            symbol: None,
            provider: Some(provider),
            message,
        };
        for tx in self.clients.values() {
            let _ = tx.send(status.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bar, PartPayload, PartType, SymbolMetadata, Tick};
    use tokio::sync::mpsc::error::TryRecvError;

    struct Fixture {
        hub: RelayHub,
        commands: HashMap<Provider, mpsc::UnboundedReceiver<SessionCommand>>,
        now: Instant,
    }

    impl Fixture {
        fn new(config: HubConfig) -> Self {
            let mut hub = RelayHub::new(config, Arc::new(RelayMetrics::new()));
            let mut commands = HashMap::new();
            for provider in Provider::ALL {
                let (tx, rx) = mpsc::unbounded_channel();
                hub.attach_provider(provider, tx);
                commands.insert(provider, rx);
            }
            Self {
                hub,
                commands,
                now: Instant::now(),
            }
        }

        fn connect(&mut self, client: ClientId) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.hub.handle_client_event(HubEvent::Connected { client, outbound: tx }, self.now);
            assert_eq!(rx.try_recv().unwrap(), ServerMessage::status(StatusState::Connected));
            rx
        }

        fn send(&mut self, client: ClientId, message: ClientMessage) {
            self.hub
                .handle_client_event(HubEvent::Message { client, message }, self.now);
        }

        fn provider(&mut self, event: ProviderEvent) {
            self.hub.handle_provider_event(event, self.now);
        }

        fn commands(&mut self, provider: Provider) -> Vec<SessionCommand> {
            let rx = self.commands.get_mut(&provider).unwrap();
            let mut out = Vec::new();
            while let Ok(command) = rx.try_recv() {
                out.push(command);
            }
            out
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(message) => out.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
            }
        }
    }

    fn eurusd() -> SubscriptionKey {
        SubscriptionKey::new("EURUSD", Provider::Stream)
    }

    fn tick(bid: f64) -> ProviderEvent {
        ProviderEvent::Tick(Tick {
            symbol: "EURUSD".into(),
            provider: Provider::Stream,
            bid,
            ask: bid + 0.0001,
            timestamp: 1,
        })
    }

    fn daily_bars() -> PartPayload {
        PartPayload::Bars {
            bars: vec![Bar {
                time: 1_700_000_000_000,
                open: 1.08,
                high: 1.09,
                low: 1.07,
                close: 1.085,
                volume: 0.0,
            }],
            metadata: None,
        }
    }

    #[test]
    fn test_two_clients_share_one_upstream_subscription() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut first = fx.connect(1);
        let mut second = fx.connect(2);

        fx.send(1, ClientMessage::subscribe(&eurusd(), 5));
        fx.send(2, ClientMessage::subscribe(&eurusd(), 5));
        assert_eq!(
            fx.commands(Provider::Stream),
            vec![SessionCommand::Subscribe("EURUSD".into())]
        );

        fx.send(1, ClientMessage::unsubscribe(&eurusd()));
        assert!(fx.commands(Provider::Stream).is_empty());

        fx.provider(tick(1.0851));
        assert!(drain(&mut first).is_empty());
        assert!(matches!(drain(&mut second).as_slice(), [ServerMessage::Tick(_)]));

        fx.send(2, ClientMessage::unsubscribe(&eurusd()));
        assert_eq!(
            fx.commands(Provider::Stream),
            vec![SessionCommand::Unsubscribe("EURUSD".into())]
        );
    }

    #[test]
    fn test_ticks_keep_provider_order() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut rx = fx.connect(1);
        fx.send(1, ClientMessage::subscribe(&eurusd(), 5));

        for bid in [1.1, 1.2, 1.3] {
            fx.provider(tick(bid));
        }
        let bids: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Tick(t) => Some(t.bid),
                _ => None,
            })
            .collect();
        assert_eq!(bids, vec![1.1, 1.2, 1.3]);
    }

    #[test]
    fn test_package_request_deduplicated_and_delivered() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut first = fx.connect(1);
        let mut second = fx.connect(2);
        let request = ClientMessage::GetSymbolDataPackage {
            symbol: "EURUSD".into(),
            provider: Provider::Stream,
            lookback_days: 0,
        };
        fx.send(1, request.clone());
        fx.send(2, request);
        assert_eq!(
            fx.commands(Provider::Stream),
            vec![SessionCommand::RequestPackage {
                symbol: "EURUSD".into(),
                lookback_days: DEFAULT_LOOKBACK_DAYS
            }]
        );

        fx.provider(ProviderEvent::Part {
            key: eurusd(),
            part: PartType::Metadata,
            payload: PartPayload::Metadata(SymbolMetadata::new(5, 4)),
        });
        fx.provider(ProviderEvent::Part {
            key: eurusd(),
            part: PartType::SeriesA,
            payload: daily_bars(),
        });

        for rx in [&mut first, &mut second] {
            match drain(rx).as_slice() {
                [ServerMessage::SymbolDataPackage(package)] => {
                    assert!(package.is_complete());
                    assert_eq!(package.digits, Some(5));
                    assert_eq!(package.open_price, Some(1.08));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_series_sends_degraded_package_to_waiters_only() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut waiter = fx.connect(1);
        let mut bystander = fx.connect(2);
        let key = SubscriptionKey::new("EURUSD", Provider::Chart);
        fx.send(2, ClientMessage::subscribe(&SubscriptionKey::new("GBPUSD", Provider::Chart), 5));
        fx.send(
            1,
            ClientMessage::GetSymbolDataPackage {
                symbol: "EURUSD".into(),
                provider: Provider::Chart,
                lookback_days: 5,
            },
        );
        fx.provider(ProviderEvent::Part {
            key: key.clone(),
            part: PartType::SeriesA,
            payload: daily_bars(),
        });

        let deadline = fx.hub.next_deadline().unwrap();
        assert_eq!(deadline, fx.now + Duration::from_secs(10));
        fx.hub.on_deadline(deadline);

        match drain(&mut waiter).as_slice() {
            [ServerMessage::SymbolDataPackage(package)] => {
                assert_eq!(package.missing_parts, vec![PartType::SeriesB]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut bystander).is_empty());
    }

    #[test]
    fn test_silent_package_request_errors_at_deadline() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut rx = fx.connect(1);
        fx.send(
            1,
            ClientMessage::GetSymbolDataPackage {
                symbol: "EURUSD".into(),
                provider: Provider::Stream,
                lookback_days: 5,
            },
        );
        fx.hub.on_deadline(fx.now + Duration::from_secs(10));

        match drain(&mut rx).as_slice() {
            [ServerMessage::Error { missing_parts, .. }] => {
                assert_eq!(missing_parts, &vec![PartType::Metadata, PartType::SeriesA]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.hub.next_deadline(), None);
    }

    #[test]
    fn test_stale_and_resumed_reach_key_subscribers() {
        let config = HubConfig {
            resubscribe_on_stale: true,
            ..HubConfig::default()
        };
        let mut fx = Fixture::new(config);
        let mut rx = fx.connect(1);
        fx.send(1, ClientMessage::subscribe(&eurusd(), 5));
        fx.commands(Provider::Stream);

        fx.hub.on_health_check(fx.now + Duration::from_secs(31));
        fx.hub.on_health_check(fx.now + Duration::from_secs(45));
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::key_status(&eurusd(), StatusState::Stale)]
        );
        assert_eq!(
            fx.commands(Provider::Stream),
            vec![
                SessionCommand::Unsubscribe("EURUSD".into()),
                SessionCommand::Subscribe("EURUSD".into())
            ]
        );

        fx.now += Duration::from_secs(50);
        fx.provider(tick(1.2));
        let messages = drain(&mut rx);
        assert_eq!(messages[0], ServerMessage::key_status(&eurusd(), StatusState::Resumed));
        assert!(matches!(messages[1], ServerMessage::Tick(_)));
    }

    #[test]
    fn test_client_disconnect_releases_subscriptions() {
        let mut fx = Fixture::new(HubConfig::default());
        let _rx = fx.connect(1);
        fx.send(1, ClientMessage::subscribe(&eurusd(), 5));
        fx.send(
            1,
            ClientMessage::GetSymbolDataPackage {
                symbol: "EURUSD".into(),
                provider: Provider::Stream,
                lookback_days: 5,
            },
        );
        fx.commands(Provider::Stream);

        fx.hub
            .handle_client_event(HubEvent::Disconnected { client: 1 }, fx.now);
        assert_eq!(
            fx.commands(Provider::Stream),
            vec![SessionCommand::Unsubscribe("EURUSD".into())]
        );
        assert!(fx.hub.registry().is_empty());
        assert_eq!(fx.hub.next_deadline(), None);
    }

    #[test]
    fn test_provider_status_broadcast() {
        let mut fx = Fixture::new(HubConfig::default());
        let mut rx = fx.connect(1);
        fx.provider(ProviderEvent::Status {
            provider: Provider::Chart,
            status: ProviderStatus::Failed("authentication rejected".into()),
        });
        match drain(&mut rx).as_slice() {
            [ServerMessage::Status { state, provider, message, .. }] => {
                assert_eq!(*state, StatusState::Error);
                assert_eq!(*provider, Some(Provider::Chart));
                assert!(message.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut hub = RelayHub::new(HubConfig::default(), Arc::new(RelayMetrics::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        hub.handle_client_event(HubEvent::Connected { client: 7, outbound: tx }, now);
        hub.handle_client_event(
            HubEvent::Message {
                client: 7,
                message: ClientMessage::subscribe(&eurusd(), 1),
            },
            now,
        );
        let messages = drain(&mut rx);
        assert!(matches!(messages.last(), Some(ServerMessage::Error { .. })));
        assert!(hub.registry().is_empty());
    }
}
