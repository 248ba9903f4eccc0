//! Configuration infrastructure
//!
//! Contains configuration loading and management for the dispatch engine.
//! Defaults mirror production settings: 1 MiB chunks, 3 concurrent
//! uploads, 3 retries. A JSON config file can override any section.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
use crate::infrastructure::rate_limiter::RateLimitConfig;
use crate::infrastructure::retry::RetryConfig;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Queue processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upload chunk size in bytes.
    pub chunk_size: usize,

    /// Maximum tasks uploading concurrently.
    pub concurrency_limit: usize,

    /// Maximum task-level re-queues before a failure becomes permanent.
    pub max_retries: u32,

    /// How long a worker waits for quota before deferring its task.
    pub rate_limit_wait_ms: u64,

    /// Poll interval while waiting for quota.
    pub rate_limit_poll_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            concurrency_limit: 3,
            max_retries: 3,
            rate_limit_wait_ms: 5_000,
            rate_limit_poll_ms: 500,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter when RUST_LOG is not set.
    pub level: String,

    /// Also write daily-rotated log files.
    pub file_output_enabled: bool,

    /// Directory for log files; defaults next to the config dir.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_output_enabled: false,
            log_dir: None,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/media_dispatch.db".to_string(),
            max_connections: 10,
        }
    }
}

/// HTTP storage provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9100".to_string(),
            user_agent: "media-dispatch/0.3".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// Loads and persists the application configuration file.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_dir = default_config_dir()?;
        Ok(Self {
            config_path: config_dir.join("config.json"),
        })
    }

    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load the config file, writing defaults on first run.
    pub async fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "config file not found, creating defaults at {}",
                self.config_path.display()
            );
            let config = AppConfig::default();
            self.save(&config).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("failed to read {}", self.config_path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.config_path.display()))?;
        Ok(config)
    }

    pub async fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("failed to write {}", self.config_path.display()))?;
        Ok(())
    }
}

/// Platform config directory for this application.
pub fn default_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("could not determine platform config directory")?;
    Ok(base.join("media-dispatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.dispatcher.chunk_size, 1024 * 1024);
        assert_eq!(config.dispatcher.concurrency_limit, 3);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.rate_limits.platforms.contains_key("instagram"));
    }

    #[tokio::test]
    async fn round_trips_through_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"));

        // first load writes defaults
        let config = manager.load().await.unwrap();
        assert!(manager.config_path().exists());

        let mut changed = config.clone();
        changed.dispatcher.concurrency_limit = 7;
        manager.save(&changed).await.unwrap();

        let reloaded = manager.load().await.unwrap();
        assert_eq!(reloaded.dispatcher.concurrency_limit, 7);
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let parsed: AppConfig = serde_json::from_str(
            r#"{"dispatcher": {"chunk_size": 2048, "concurrency_limit": 2, "max_retries": 1,
                "rate_limit_wait_ms": 100, "rate_limit_poll_ms": 10}}"#,
        )
        .unwrap();
        assert_eq!(parsed.dispatcher.chunk_size, 2048);
        assert_eq!(parsed.retry.max_retries, 3);
        assert!(!parsed.logging.file_output_enabled);
    }
}
