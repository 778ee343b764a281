//! Provider supervisor
//!
//! Owns one `ProviderSession` and is the only place that retries it. The
//! supervisor keeps the provider-side demand (active symbols and unanswered
//! package requests), connects only while there is demand, backs off through a
//! `ReconnectionScheduler` after failures, and replays demand after every
//! reconnect.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::Level;

use crate::core::PartType;
use crate::log_provider;
use crate::provider::{
    ProviderEvent, ProviderSession, ProviderStatus, SessionCommand, SessionError, SessionState,
};
use crate::ws::{BackoffConfig, ReconnectionScheduler};

/// Supervisor settings
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub backoff: BackoffConfig,
    /// Package requests older than this are not replayed after a reconnect
    pub package_ttl: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            package_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct OutstandingPackage {
    lookback_days: u32,
    requested_at: Instant,
    seen: HashSet<PartType>,
}

enum Establish {
    Ready,
    NoDemand,
    Failed,
    Shutdown,
}

/// Retry owner for one provider session
pub struct ProviderSupervisor<S> {
    session: S,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::Sender<ProviderEvent>,
    scheduler: ReconnectionScheduler,
    package_ttl: Duration,
    active: BTreeSet<String>,
    outstanding: HashMap<String, OutstandingPackage>,
    /// Next connect must wait for a backoff delay
    retry_pending: bool,
    /// Terminal failure; cleared by the next command
    failed: bool,
}

impl<S: ProviderSession> ProviderSupervisor<S> {
    pub fn new(
        session: S,
        config: SupervisorConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Self {
        Self {
            session,
            commands,
            events,
            scheduler: ReconnectionScheduler::new(config.backoff),
            package_ttl: config.package_ttl,
            active: BTreeSet::new(),
            outstanding: HashMap::new(),
            retry_pending: false,
            failed: false,
        }
    }

    fn has_demand(&self) -> bool {
        !self.active.is_empty() || !self.outstanding.is_empty()
    }

    fn prune_outstanding(&mut self, now: Instant) {
        let ttl = self.package_ttl;
        self.outstanding.retain(|_, p| p.requested_at + ttl > now);
    }

    /// Track demand without touching the session
    fn record(&mut self, command: &SessionCommand) {
        match command {
            SessionCommand::Subscribe(symbol) => {
                self.active.insert(symbol.clone());
            }
            SessionCommand::Unsubscribe(symbol) => {
                self.active.remove(symbol);
            }
            SessionCommand::RequestPackage {
                symbol,
                lookback_days,
            } => {
                self.outstanding.insert(
                    symbol.clone(),
                    OutstandingPackage {
                        lookback_days: *lookback_days,
                        requested_at: Instant::now(),
                        seen: HashSet::new(),
                    },
                );
            }
        }
    }

    async fn apply(&mut self, command: SessionCommand) {
        self.record(&command);
        let result = match &command {
            SessionCommand::Subscribe(symbol) => self.session.subscribe(symbol).await,
            SessionCommand::Unsubscribe(symbol) => self.session.unsubscribe(symbol).await,
            SessionCommand::RequestPackage {
                symbol,
                lookback_days,
            } => self.session.request_package(symbol, *lookback_days).await,
        };
        if let Err(e) = result {
            log_provider!(
                Level::WARN,
                provider = %self.session.provider(),
                "{:?} not applied, will replay after reconnect: {}",
                command,
                e
            );
        }
    }

    async fn replay(&mut self) {
        let provider = self.session.provider();
        let symbols: Vec<String> = self.active.iter().cloned().collect();
        let packages: Vec<(String, u32)> = self
            .outstanding
            .iter_mut()
            .map(|(symbol, p)| {
                p.seen.clear();
                (symbol.clone(), p.lookback_days)
            })
            .collect();

        log_provider!(
            Level::INFO,
            provider = %provider,
            "Replaying {} subscriptions and {} package requests",
            symbols.len(),
            packages.len()
        );
        for symbol in &symbols {
            if let Err(e) = self.session.subscribe(symbol).await {
                log_provider!(Level::WARN, provider = %provider, "Replay of {} failed: {}", symbol, e);
            }
        }
        for (symbol, lookback_days) in &packages {
            if let Err(e) = self.session.request_package(symbol, *lookback_days).await {
                log_provider!(Level::WARN, provider = %provider, "Replay of {} package failed: {}", symbol, e);
            }
        }
    }

    async fn emit(&self, event: ProviderEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn emit_status(&self, status: ProviderStatus) -> bool {
        self.emit(ProviderEvent::Status {
            provider: self.session.provider(),
            status,
        })
        .await
    }

    /// Wait out one backoff delay while still tracking demand
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(wake) => return true,
                command = self.commands.recv() => match command {
                    Some(command) => self.record(&command),
                    None => return false,
                },
            }
        }
    }

    async fn establish(&mut self) -> Establish {
        let provider = self.session.provider();
        loop {
            if self.retry_pending {
                let delay = match self.scheduler.next_delay() {
                    Some(delay) => delay,
                    None => {
                        log_provider!(Level::ERROR, provider = %provider, "Reconnect attempts exhausted");
                        self.retry_pending = false;
                        if !self.emit_status(ProviderStatus::Failed("reconnect attempts exhausted".into())).await {
                            return Establish::Shutdown;
                        }
                        return Establish::Failed;
                    }
                };
                log_provider!(
                    Level::INFO,
                    provider = %provider,
                    "Reconnect attempt {} in {:?}",
                    self.scheduler.attempt(),
                    delay
                );
                if !self.wait_backoff(delay).await {
                    return Establish::Shutdown;
                }
                self.prune_outstanding(Instant::now());
                if !self.has_demand() {
                    log_provider!(Level::INFO, provider = %provider, "No demand left, not reconnecting");
                    return Establish::NoDemand;
                }
            }

            if !self.emit_status(ProviderStatus::Connecting).await {
                return Establish::Shutdown;
            }
            match self.session.connect().await {
                Ok(()) => {
                    self.scheduler.reset();
                    self.retry_pending = false;
                    if !self.emit_status(ProviderStatus::Connected).await {
                        return Establish::Shutdown;
                    }
                    self.replay().await;
                    return Establish::Ready;
                }
                Err(e) if e.is_permanent() => {
                    log_provider!(Level::ERROR, provider = %provider, "Permanent failure: {}", e);
                    self.retry_pending = false;
                    if !self.emit_status(ProviderStatus::Failed(e.to_string())).await {
                        return Establish::Shutdown;
                    }
                    return Establish::Failed;
                }
                Err(e) => {
                    log_provider!(Level::WARN, provider = %provider, "Connect failed: {}", e);
                    self.retry_pending = true;
                }
            }
        }
    }

    /// Forward a session event, updating outstanding package state
    async fn forward(&mut self, event: ProviderEvent) -> bool {
        if let ProviderEvent::Part { key, part, .. } = &event {
            let required = key.provider.required_parts();
            if let Some(p) = self.outstanding.get_mut(&key.symbol) {
                p.seen.insert(*part);
                if required.iter().all(|r| p.seen.contains(r)) {
                    self.outstanding.remove(&key.symbol);
                }
            }
        }
        self.emit(event).await
    }

    async fn on_disconnect(&mut self, error: SessionError) -> bool {
        let provider = self.session.provider();
        log_provider!(Level::WARN, provider = %provider, "Disconnected: {}", error);
        self.session.close().await;
        self.retry_pending = true;
        self.emit(ProviderEvent::Disconnected {
            provider,
            reason: error.to_string(),
        })
        .await
    }

    /// Run until the relay drops its command sender or event receiver
    pub async fn run(mut self) {
        let provider = self.session.provider();
        log_provider!(Level::INFO, provider = %provider, "Supervisor started");

        loop {
            self.prune_outstanding(Instant::now());

            // An idle but open session keeps running so commands reach it
            // and heartbeats continue
            let idle = !self.has_demand() && self.session.state() != SessionState::Ready;
            if self.failed || idle {
                match self.commands.recv().await {
                    Some(command) => {
                        if self.failed {
                            self.failed = false;
                            self.scheduler.reset();
                        }
                        self.record(&command);
                        continue;
                    }
                    None => break,
                }
            }

            if self.session.state() != SessionState::Ready {
                match self.establish().await {
                    Establish::Ready => {}
                    Establish::NoDemand => continue,
                    Establish::Failed => {
                        self.failed = true;
                        continue;
                    }
                    Establish::Shutdown => break,
                }
            }

            let alive = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.apply(command).await;
                        true
                    }
                    None => false,
                },
                event = self.session.next_event() => match event {
                    Ok(event) => self.forward(event).await,
                    Err(e) => self.on_disconnect(e).await,
                },
            };
            if !alive {
                break;
            }
        }

        self.session.close().await;
        log_provider!(Level::INFO, provider = %provider, "Supervisor stopped");
    }
}
