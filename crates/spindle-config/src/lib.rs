//! Worker configuration.
//!
//! Settings are loaded in layers: an optional `config/worker.toml`
//! file, then `SPINDLE_`-prefixed environment variables, then the
//! plain `REDIS_URL` variable. A `.env` file is honored when present.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source failed to load or deserialize.
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// A loaded value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Recognized log levels.
pub const LOG_LEVELS: [&str; 5] = ["debug", "info", "warn", "error", "fatal"];

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_concurrency() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The worker's configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Connection URL for the Redis store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Queue names the worker polls.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Default per-queue concurrency.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-queue concurrency overrides.
    #[serde(default)]
    pub queue_concurrency: HashMap<String, usize>,

    /// Log threshold: debug, info, warn, error or fatal.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            queues: default_queues(),
            concurrency: default_concurrency(),
            queue_concurrency: HashMap::new(),
            log_level: default_log_level(),
        }
    }
}

impl WorkerSettings {
    /// Loads settings from the default location (`./config`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("./config")
    }

    /// Loads settings with the file layer rooted at `config_dir`.
    pub fn load_from(config_dir: &str) -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("no .env file loaded: {}", e);
        }

        let mut builder = Config::builder();

        let file_path = format!("{}/worker.toml", config_dir);
        if Path::new(&file_path).exists() {
            debug!("loading config from: {}", file_path);
            builder = builder.add_source(File::with_name(&file_path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("SPINDLE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("queues")
                .try_parsing(true),
        );

        let mut settings: WorkerSettings = builder.build()?.try_deserialize()?;

        // REDIS_URL is the documented operator variable and wins over
        // the file layer.
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                settings.redis_url = url;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the loaded values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::Invalid("redis_url is required".to_string()));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one queue is required".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level: {} (expected one of {:?})",
                self.log_level, LOG_LEVELS
            )));
        }
        Ok(())
    }

    /// Concurrency for a queue, applying the override map.
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.concurrency)
            .max(1)
    }

    /// Directive for the tracing `EnvFilter`. The `fatal` level maps
    /// to `error`, the subscriber's highest threshold.
    pub fn log_filter(&self) -> &str {
        match self.log_level.as_str() {
            "fatal" => "error",
            level => level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(settings.queues, vec!["default".to_string()]);
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.log_level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_concurrency_override() {
        let mut settings = WorkerSettings::default();
        settings.queue_concurrency.insert("bulk".to_string(), 20);

        assert_eq!(settings.concurrency_for("bulk"), 20);
        assert_eq!(settings.concurrency_for("default"), 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = WorkerSettings::default();
        settings.queues.clear();
        assert!(settings.validate().is_err());

        let mut settings = WorkerSettings::default();
        settings.concurrency = 0;
        assert!(settings.validate().is_err());

        let mut settings = WorkerSettings::default();
        settings.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_fatal_maps_to_error_filter() {
        let settings = WorkerSettings {
            log_level: "fatal".to_string(),
            ..WorkerSettings::default()
        };
        assert!(settings.validate().is_ok());
        assert_eq!(settings.log_filter(), "error");

        let settings = WorkerSettings::default();
        assert_eq!(settings.log_filter(), "info");
    }
}
