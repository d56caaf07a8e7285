//! Configuration management for infrapilot
//!
//! Settings are loaded from environment variables with sensible defaults and
//! checked with [`InfrapilotConfig::validate`]. No configuration files are read.
//!
//! # Environment Variables
//!
//! - `INFRAPILOT_ENGINE_ENDPOINT`: engine HTTP endpoint, loopback only - default: `OLLAMA_HOST` or "http://127.0.0.1:11434"
//! - `INFRAPILOT_ENGINE_BINARY`: engine executable - default: "ollama"
//! - `INFRAPILOT_MODEL`: force a catalog model instead of automatic selection
//! - `INFRAPILOT_REQUEST_TIMEOUT`: per-request timeout in seconds - default: "30"
//! - `INFRAPILOT_STARTUP_TIMEOUT`: engine startup timeout in seconds - default: "60"
//! - `INFRAPILOT_HEALTH_TIMEOUT`: health probe timeout in seconds - default: "2"
//! - `INFRAPILOT_SHUTDOWN_GRACE`: seconds between SIGTERM and kill - default: "5"
//! - `INFRAPILOT_CACHE_TTL`: response cache TTL in seconds - default: "3600"
//! - `INFRAPILOT_CACHE_MAX_BYTES`: hard cap on the response cache - default: 512MB
//! - `INFRAPILOT_FAILURE_THRESHOLD`: failed health checks before restart - default: "3"
//! - `INFRAPILOT_MAX_RESTARTS`: restart attempts before giving up - default: "5"
//! - `INFRAPILOT_HEALTH_INTERVAL`: background health check period in seconds - default: "15"
//! - `INFRAPILOT_LOG_LEVEL`: logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use infrapilot::InfrapilotConfig;
//!
//! let config = InfrapilotConfig::default();
//! config.validate().expect("Invalid configuration");
//! println!("{}", config);
//! ```

use crate::llm::engine::{
    ensure_loopback, BackoffPolicy, HealthConfig, SupervisorSettings, DEFAULT_BINARY,
    DEFAULT_ENDPOINT,
};
use crate::llm::{ConfiguratorSettings, LocalAiError, SelectionPolicy};
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 2;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_MAX_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;

const MAX_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Engine endpoint '{0}' is not a loopback address. Only localhost endpoints are allowed")]
    NonLocalEndpoint(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for LocalAiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NonLocalEndpoint(endpoint) => LocalAiError::NonLocalEndpoint { endpoint },
            other => LocalAiError::Config {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfrapilotConfig {
    pub engine_endpoint: String,
    pub engine_binary: String,
    pub model_override: Option<String>,
    pub request_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_hard_cap_bytes: u64,
    pub failure_threshold: u32,
    pub max_restart_attempts: u32,
    pub health_interval_secs: u64,
    pub log_level: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Default for InfrapilotConfig {
    fn default() -> Self {
        let engine_endpoint = env::var("INFRAPILOT_ENGINE_ENDPOINT")
            .or_else(|_| env::var("OLLAMA_HOST"))
            .map(|endpoint| normalize_endpoint(&endpoint))
            .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let engine_binary =
            env::var("INFRAPILOT_ENGINE_BINARY").unwrap_or_else(|_| DEFAULT_BINARY.to_string());

        let model_override = env::var("INFRAPILOT_MODEL")
            .ok()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        let log_level = env::var("INFRAPILOT_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        Self {
            engine_endpoint,
            engine_binary,
            model_override,
            request_timeout_secs: env_parsed(
                "INFRAPILOT_REQUEST_TIMEOUT",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            startup_timeout_secs: env_parsed(
                "INFRAPILOT_STARTUP_TIMEOUT",
                DEFAULT_STARTUP_TIMEOUT_SECS,
            ),
            health_timeout_secs: env_parsed("INFRAPILOT_HEALTH_TIMEOUT", DEFAULT_HEALTH_TIMEOUT_SECS),
            shutdown_grace_secs: env_parsed("INFRAPILOT_SHUTDOWN_GRACE", DEFAULT_SHUTDOWN_GRACE_SECS),
            cache_ttl_secs: env_parsed("INFRAPILOT_CACHE_TTL", DEFAULT_CACHE_TTL_SECS),
            cache_hard_cap_bytes: env_parsed("INFRAPILOT_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES),
            failure_threshold: env_parsed("INFRAPILOT_FAILURE_THRESHOLD", DEFAULT_FAILURE_THRESHOLD),
            max_restart_attempts: env_parsed("INFRAPILOT_MAX_RESTARTS", DEFAULT_MAX_RESTARTS),
            health_interval_secs: env_parsed(
                "INFRAPILOT_HEALTH_INTERVAL",
                DEFAULT_HEALTH_INTERVAL_SECS,
            ),
            log_level,
        }
    }
}

/// `OLLAMA_HOST` is commonly given without a scheme ("127.0.0.1:11434")
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

impl InfrapilotConfig {
    /// Validates the configuration
    ///
    /// Checks that the endpoint is loopback-only, timeouts are within
    /// 1..=600 seconds, counters are positive and the log level is valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if ensure_loopback(&self.engine_endpoint).is_err() {
            return Err(ConfigError::NonLocalEndpoint(self.engine_endpoint.clone()));
        }

        if self.engine_binary.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Engine binary must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("Request timeout", self.request_timeout_secs),
            ("Startup timeout", self.startup_timeout_secs),
            ("Health timeout", self.health_timeout_secs),
            ("Shutdown grace period", self.shutdown_grace_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be at least 1 second",
                    name
                )));
            }
            if value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot exceed 10 minutes",
                    name
                )));
            }
        }

        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Cache TTL must be at least 1 second".to_string(),
            ));
        }
        if self.health_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Health check interval must be at least 1 second".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "Failure threshold must be at least 1".to_string(),
            ));
        }
        if self.max_restart_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "Max restart attempts must be at least 1".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            preferred_model: self.model_override.clone(),
            ..SelectionPolicy::default()
        }
    }

    pub fn configurator_settings(&self) -> ConfiguratorSettings {
        ConfiguratorSettings {
            cache_hard_cap_bytes: self.cache_hard_cap_bytes,
            request_timeout_seconds: self.request_timeout_secs,
            ..ConfiguratorSettings::default()
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            failure_threshold: self.failure_threshold,
            backoff: BackoffPolicy {
                max_attempts: self.max_restart_attempts,
                ..BackoffPolicy::default()
            },
            ..SupervisorSettings::default()
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_secs(self.health_interval_secs),
            ..HealthConfig::default()
        }
    }
}

impl fmt::Display for InfrapilotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Infrapilot Configuration:")?;
        writeln!(f, "  Engine Endpoint: {}", self.engine_endpoint)?;
        writeln!(f, "  Engine Binary: {}", self.engine_binary)?;
        writeln!(
            f,
            "  Model: {}",
            self.model_override.as_deref().unwrap_or("auto")
        )?;
        writeln!(f, "  Request Timeout: {}s", self.request_timeout_secs)?;
        writeln!(f, "  Startup Timeout: {}s", self.startup_timeout_secs)?;
        writeln!(f, "  Cache TTL: {}s", self.cache_ttl_secs)?;
        writeln!(f, "  Cache Max Bytes: {}", self.cache_hard_cap_bytes)?;
        writeln!(
            f,
            "  Restart Policy: {} failures, {} attempts",
            self.failure_threshold, self.max_restart_attempts
        )?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
