//! Centralized file-based logging
//!
//! Writes logs under the configured directory, separated by log type:
//! - main/     all events, JSON
//! - error/    WARN and above
//! - provider/ upstream sessions and supervisors
//! - relay/    hub, registry, coordinator, health, server
//! - client/   downstream connection manager

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::{filter_fn, LevelFilter},
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use super::config::LoggingConfig;

const LOG_TYPES: [&str; 5] = ["main", "error", "provider", "relay", "client"];

/// Initialize file + console logging
///
/// The returned guards flush the non-blocking writers and must live until
/// shutdown.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    let logs_dir = Path::new(&config.dir);
    for log_type in LOG_TYPES {
        fs::create_dir_all(logs_dir.join(log_type))?;
    }

    let mut guards = Vec::with_capacity(LOG_TYPES.len());
    let mut appender = |name: &str| {
        let (writer, guard) = create_appender(&logs_dir.join(name), name);
        guards.push(guard);
        writer
    };

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(appender("main"))
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(appender("error"))
        .with_ansi(false)
        .with_target(true)
        .with_filter(LevelFilter::WARN);

    let provider_layer = tracing_subscriber::fmt::layer()
        .with_writer(appender("provider"))
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter_fn(|metadata| {
            metadata.target() == "provider" || metadata.target().contains("::provider")
        }));

    let relay_layer = tracing_subscriber::fmt::layer()
        .with_writer(appender("relay"))
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter_fn(|metadata| {
            metadata.target() == "relay" || metadata.target().contains("::relay")
        }));

    let client_layer = tracing_subscriber::fmt::layer()
        .with_writer(appender("client"))
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter_fn(|metadata| {
            metadata.target() == "client" || metadata.target().contains("::client")
        }));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(provider_layer)
        .with(relay_layer)
        .with(client_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    tracing::info!("Logging initialized, files in {}", config.dir);

    Ok(guards)
}

fn create_appender(dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    tracing_appender::non_blocking(appender)
}

/// Log to the provider file
#[macro_export]
macro_rules! log_provider {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "provider", $level, $($arg)+)
    };
}

/// Log to the relay file
#[macro_export]
macro_rules! log_relay {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "relay", $level, $($arg)+)
    };
}

/// Log to the client file
#[macro_export]
macro_rules! log_client {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "client", $level, $($arg)+)
    };
}
