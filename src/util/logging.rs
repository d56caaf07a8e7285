//! Structured logging setup for infrapilot
//!
//! Logging goes through `tracing`. The subscriber is installed at most once
//! per process; later calls are no-ops, and an already installed global
//! subscriber (for example one set up by the embedding CLI) is left alone.
//!
//! ```no_run
//! use infrapilot::util::logging;
//!
//! // INFRAPILOT_LOG_LEVEL=debug INFRAPILOT_LOG_JSON=true
//! logging::init_from_env();
//! tracing::info!("engine supervisor starting");
//! ```

use crate::config::InfrapilotConfig;
use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Noisy HTTP internals kept at warn unless `RUST_LOG` says otherwise
const QUIET_TARGETS: [&str; 3] = ["h2", "hyper", "reqwest"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Minimum level for infrapilot's own events
    pub level: Level,
    /// One JSON object per line instead of human-readable output
    pub use_json: bool,
    pub include_target: bool,
    /// File and line of each event
    pub include_location: bool,
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// JSON output with full metadata, for log collectors
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            use_json: true,
            include_target: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    /// Reads `INFRAPILOT_LOG_LEVEL` and `INFRAPILOT_LOG_JSON`
    pub fn from_env() -> Self {
        let level = env::var("INFRAPILOT_LOG_LEVEL")
            .ok()
            .and_then(|v| parse_level(&v))
            .unwrap_or(Level::INFO);

        let use_json = env::var("INFRAPILOT_LOG_JSON")
            .ok()
            .and_then(|v| v.trim().parse::<bool>().ok())
            .unwrap_or(false);

        Self {
            level,
            use_json,
            ..Default::default()
        }
    }

    /// Level taken from a validated [`InfrapilotConfig`]
    pub fn from_config(config: &InfrapilotConfig) -> Self {
        Self {
            level: parse_level(&config.log_level).unwrap_or(Level::INFO),
            ..Self::from_env()
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env();

        if let Ok(directive) = format!("infrapilot={}", self.level).parse() {
            filter = filter.add_directive(directive);
        }

        if env::var("RUST_LOG").is_err() {
            for target in QUIET_TARGETS {
                if let Ok(directive) = format!("{}=warn", target).parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        filter
    }
}

/// Case-insensitive level name, `None` if unrecognized
pub fn parse_level(level_str: &str) -> Option<Level> {
    match level_str.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let layer = fmt::layer()
            .with_target(config.include_target)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_thread_names(config.include_thread_ids);

        let registry = tracing_subscriber::registry().with(config.filter());
        let installed = if config.use_json {
            registry.with(layer.json()).try_init()
        } else {
            registry.with(layer).try_init()
        };

        if installed.is_err() {
            tracing::debug!("A global tracing subscriber is already installed");
        }
    });
}

pub fn init_default() {
    init_logging(LoggingConfig::default());
}

pub fn init_from_env() {
    init_logging(LoggingConfig::from_env());
}
