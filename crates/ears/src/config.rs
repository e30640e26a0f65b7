//! Configuration management for the EARS router.
//!
//! Loads and validates the service configuration from a TOML file. Missing
//! sections and fields fall back to their defaults.

use ears_core::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Queue, delivery and worker settings for the routing core
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Initial routing table
    #[serde(default)]
    pub routes: RouteSettings,
    /// Shared-library adapter loading
    #[serde(default)]
    pub plugins: PluginSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Graceful shutdown settings
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

/// Where the initial routing table comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// JSON file holding an array of routing entries
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Shared-library adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Directory scanned for adapter libraries
    #[serde(default = "default_plugin_directory")]
    pub directory: String,
    /// Whether to scan the directory at startup
    #[serde(default)]
    pub auto_load: bool,
}

fn default_plugin_directory() -> String {
    "plugins".to_string()
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: default_plugin_directory(),
            auto_load: false,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// How long queued events may keep routing after a shutdown signal
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file does not exist, a default configuration file is written
    /// at that path and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration for correctness and consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.runtime.queue.capacity == 0 {
            return Err("runtime.queue.capacity must be greater than 0".to_string());
        }

        if self.runtime.workers.workers == 0 {
            return Err("runtime.workers.workers must be greater than 0".to_string());
        }

        self.runtime.delivery.validate()?;

        if self.plugins.auto_load && self.plugins.directory.is_empty() {
            return Err("Plugin directory cannot be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ears_core::OverflowPolicy;
    use tempfile::tempdir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.runtime.queue.capacity, 10_000);
        assert_eq!(config.runtime.queue.overflow, OverflowPolicy::Block);
        assert_eq!(config.runtime.delivery.max_attempts, 5);
        assert!(config.runtime.workers.workers > 0);
        assert!(config.routes.file.is_none());
        assert_eq!(config.plugins.directory, "plugins");
        assert!(!config.plugins.auto_load);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert_eq!(config.shutdown.drain_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [runtime.queue]
            capacity = 16
            overflow = "reject"

            [runtime.delivery]
            max_attempts = 2

            [routes]
            file = "routes.json"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.queue.capacity, 16);
        assert_eq!(config.runtime.queue.overflow, OverflowPolicy::Reject);
        assert_eq!(config.runtime.delivery.max_attempts, 2);
        assert_eq!(config.runtime.delivery.initial_backoff_ms, 100);
        assert_eq!(config.routes.file, Some(PathBuf::from("routes.json")));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.shutdown.drain_timeout_ms, 5_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.runtime.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.workers.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.delivery.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.delivery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.plugins.auto_load = true;
        config.plugins.directory.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_writes_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ears.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ears.toml");
        tokio::fs::write(&path, "runtime = [").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }
}
