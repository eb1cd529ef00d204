use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("State directory cannot be empty")]
    EmptyStateDir,

    #[error("Invalid lease_ttl_secs: {0}. Must be at least 1")]
    InvalidLeaseTtl(u64),

    #[error("Invalid heartbeat_divisor: {0}. Must be at least 2 so renewals precede expiry")]
    InvalidHeartbeatDivisor(u32),

    #[error("Invalid breaker window: {0}. Must be at least 10")]
    InvalidBreakerWindow(usize),

    #[error("Invalid breaker threshold: {0}. Must be in (0, 1]")]
    InvalidBreakerThreshold(f64),

    #[error("Invalid fairness cap: {0}. Must be in (0, 1]")]
    InvalidFairnessCap(f64),

    #[error("Invalid quorum: {0}. Must be at least 1")]
    InvalidQuorum(usize),

    #[error("Invalid max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

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
    /// 2. .conclave/config.yaml (project config)
    /// 3. .conclave/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CONCLAVE_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".conclave/config.yaml"))
            .merge(Yaml::file(".conclave/local.yaml"))
            .merge(Env::prefixed("CONCLAVE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CONCLAVE_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.paths.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyStateDir);
        }

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

        if config.dispatcher.lease_ttl_secs == 0 {
            return Err(ConfigError::InvalidLeaseTtl(config.dispatcher.lease_ttl_secs));
        }

        if config.dispatcher.heartbeat_divisor < 2 {
            return Err(ConfigError::InvalidHeartbeatDivisor(
                config.dispatcher.heartbeat_divisor,
            ));
        }

        if config.breaker.window < 10 {
            return Err(ConfigError::InvalidBreakerWindow(config.breaker.window));
        }

        if !(config.breaker.threshold > 0.0 && config.breaker.threshold <= 1.0) {
            return Err(ConfigError::InvalidBreakerThreshold(config.breaker.threshold));
        }

        if config.breaker.min_samples > config.breaker.window {
            return Err(ConfigError::ValidationFailed(format!(
                "breaker min_samples ({}) exceeds window ({})",
                config.breaker.min_samples, config.breaker.window
            )));
        }

        if !(config.governance.fairness_cap > 0.0 && config.governance.fairness_cap <= 1.0) {
            return Err(ConfigError::InvalidFairnessCap(config.governance.fairness_cap));
        }

        if config.council.quorum == 0 {
            return Err(ConfigError::InvalidQuorum(config.council.quorum));
        }

        if config.router.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.router.max_attempts));
        }

        if config.router.initial_backoff_ms >= config.router.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.router.initial_backoff_ms,
                config.router.max_backoff_ms,
            ));
        }

        for (task_type, handler) in &config.handlers {
            if handler.command.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "Handler '{task_type}' command cannot be empty"
                )));
            }
        }

        Ok(())
    }
}
