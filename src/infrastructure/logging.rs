//! Logging system configuration and initialization
//!
//! Console logging through an env-filtered fmt layer, with optional daily
//! file rotation. Worker guards for the non-blocking file writer are held
//! in a global so the writer stays alive for the process lifetime.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::infrastructure::config::{LoggingConfig, default_config_dir};

lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Initialize the global tracing subscriber.
///
/// RUST_LOG takes precedence over the configured level. Returns an error if
/// a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer().with_target(true);

    if config.file_output_enabled {
        let log_dir = resolve_log_dir(config)?;
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

        let file_appender = rolling::daily(&log_dir, "media-dispatch.log");
        let (writer, guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(guard);

        let file_layer = fmt::layer().with_ansi(false).with_writer(writer);

        Registry::default()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .context("failed to install tracing subscriber")?;
    } else {
        Registry::default()
            .with(filter)
            .with(console_layer)
            .try_init()
            .context("failed to install tracing subscriber")?;
    }

    tracing::info!("logging initialized (level: {})", config.level);
    Ok(())
}

fn resolve_log_dir(config: &LoggingConfig) -> Result<PathBuf> {
    match &config.log_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(default_config_dir()?.join("logs")),
    }
}
