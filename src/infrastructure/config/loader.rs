use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::{Config, HandlerAction};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Invalid {field}: {value}. Must be at least 1")]
    InvalidTimeout { field: &'static str, value: u64 },

    #[error("Invalid {field}: {value}. Must be at least 1")]
    InvalidCapacity { field: &'static str, value: usize },

    #[error("Invalid {field}: {value}. Must be between 0.0 and 1.0")]
    InvalidRatio { field: &'static str, value: f64 },

    #[error("Invalid breaker window: minimum_calls ({0}) must not exceed window_size ({1})")]
    InvalidWindow(usize, usize),

    #[error("Invalid backoff_multiplier: {0}. Must be at least 1.0")]
    InvalidBackoff(f64),

    #[error("Invalid cooldown: cooldown_ms ({0}) must not exceed max_cooldown_ms ({1})")]
    InvalidCooldown(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .hookgate/config.yaml (project config)
    /// 3. .hookgate/local.yaml (project local overrides, optional)
    /// 4. Environment variables (HOOKGATE_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".hookgate/config.yaml"))
            .merge(Yaml::file(".hookgate/local.yaml"))
            .merge(Env::prefixed("HOOKGATE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, then apply `HOOKGATE_*` overrides
    pub fn load_with_overrides(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("HOOKGATE_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        // Logging
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        // Time budgets
        for (field, value) in [
            ("dispatcher.pipeline_timeout_ms", config.dispatcher.pipeline_timeout_ms),
            ("fast_path.timeout_ms", config.fast_path.timeout_ms),
            ("cache.sweep_interval_ms", config.cache.sweep_interval_ms),
            ("breaker.window_duration_ms", config.breaker.window_duration_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout { field, value });
            }
        }

        // Capacities
        for (field, value) in [
            ("dispatcher.batch_concurrency", config.dispatcher.batch_concurrency),
            ("cache.max_entries", config.cache.max_entries),
            ("breaker.window_size", config.breaker.window_size),
            ("breaker.minimum_calls", config.breaker.minimum_calls),
            ("metrics.latency_window", config.metrics.latency_window),
            ("notices.capacity", config.notices.capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidCapacity { field, value });
            }
        }

        // Ratios
        for (field, value) in [
            ("breaker.failure_ratio_threshold", config.breaker.failure_ratio_threshold),
            ("health.target_success_rate", config.health.target_success_rate),
            ("health.max_error_rate", config.health.max_error_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRatio { field, value });
            }
        }
        if !(config.metrics.ewma_alpha > 0.0 && config.metrics.ewma_alpha <= 1.0) {
            return Err(ConfigError::InvalidRatio {
                field: "metrics.ewma_alpha",
                value: config.metrics.ewma_alpha,
            });
        }

        // Breaker
        if config.breaker.minimum_calls > config.breaker.window_size {
            return Err(ConfigError::InvalidWindow(
                config.breaker.minimum_calls,
                config.breaker.window_size,
            ));
        }
        if config.breaker.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(config.breaker.backoff_multiplier));
        }
        if config.breaker.cooldown_ms > config.breaker.max_cooldown_ms {
            return Err(ConfigError::InvalidCooldown(
                config.breaker.cooldown_ms,
                config.breaker.max_cooldown_ms,
            ));
        }

        // Handler declarations
        let mut seen = HashSet::new();
        for handler in &config.handlers {
            if handler.id.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "Handler id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(handler.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "Handler '{}' is declared more than once",
                    handler.id
                )));
            }
            if handler.kind.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "Handler '{}' kind cannot be empty",
                    handler.id
                )));
            }
            if handler.timeout_ms == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "Handler '{}' timeout_ms must be at least 1",
                    handler.id
                )));
            }
            if let HandlerAction::RunScript { command, .. } = &handler.action {
                if command.trim().is_empty() {
                    return Err(ConfigError::ValidationFailed(format!(
                        "Handler '{}' command cannot be empty",
                        handler.id
                    )));
                }
            }
        }

        Ok(())
    }
}
