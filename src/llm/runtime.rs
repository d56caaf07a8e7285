//! Derivation of engine execution parameters
//!
//! [`RuntimeConfigurator::configure`] is a pure function of the hardware
//! snapshot and the model recommendation: the same inputs always produce the
//! same [`RuntimeConfig`].

use super::error::LocalAiError;
use super::hardware::HardwareSpecs;
use super::selector::ModelRecommendation;
use serde::{Deserialize, Serialize};
use tracing::debug;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Execution parameters for the inference engine and the response cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Engine tag of the model to load
    pub model: String,
    pub thread_count: usize,
    pub context_window_tokens: u32,
    pub use_memory_mapping: bool,
    pub cache_capacity_entries: usize,
    pub cache_capacity_bytes: u64,
    pub request_timeout_seconds: u64,
}

impl RuntimeConfig {
    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<(), LocalAiError> {
        let problem = if self.model.is_empty() {
            Some("model name is empty".to_string())
        } else if self.thread_count == 0 {
            Some("thread count must be at least 1".to_string())
        } else if self.context_window_tokens < MIN_CONTEXT_TOKENS {
            Some(format!(
                "context window {} is below the {} token floor",
                self.context_window_tokens, MIN_CONTEXT_TOKENS
            ))
        } else if self.request_timeout_seconds == 0 {
            Some("request timeout must be at least 1 second".to_string())
        } else {
            None
        };

        match problem {
            Some(message) => Err(LocalAiError::Config { message }),
            None => Ok(()),
        }
    }
}

const MIN_CONTEXT_TOKENS: u32 = 512;

/// Constants the configurator derives from
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguratorSettings {
    /// Upper bound on worker threads
    pub max_threads: usize,
    /// Headroom below which the context window is halved (and halved again below half of it)
    pub context_pressure_threshold_bytes: u64,
    /// Smallest context window ever configured
    pub min_context_tokens: u32,
    /// Share of available memory given to the response cache
    pub cache_memory_ratio: f64,
    /// Absolute cap on the response cache
    pub cache_hard_cap_bytes: u64,
    /// Expected size of a cached response, used to size the entry cap
    pub average_entry_bytes: u64,
    pub min_cache_entries: usize,
    pub max_cache_entries: usize,
    pub request_timeout_seconds: u64,
}

impl Default for ConfiguratorSettings {
    fn default() -> Self {
        Self {
            max_threads: 8,
            context_pressure_threshold_bytes: GIB,
            min_context_tokens: MIN_CONTEXT_TOKENS,
            cache_memory_ratio: 0.10,
            cache_hard_cap_bytes: 512 * MIB,
            average_entry_bytes: 50 * 1024,
            min_cache_entries: 10,
            max_cache_entries: 500,
            request_timeout_seconds: 30,
        }
    }
}

/// Turns a hardware snapshot and a model recommendation into a [`RuntimeConfig`]
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigurator {
    settings: ConfiguratorSettings,
}

impl RuntimeConfigurator {
    pub fn new(settings: ConfiguratorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConfiguratorSettings {
        &self.settings
    }

    pub fn configure(
        &self,
        specs: &HardwareSpecs,
        recommendation: &ModelRecommendation,
    ) -> RuntimeConfig {
        let settings = &self.settings;

        let thread_count = specs.cpu_threads.clamp(1, settings.max_threads.max(1));
        let context_window_tokens = self.context_window(recommendation);

        let cache_capacity_bytes = ((specs.available_memory_bytes as f64
            * settings.cache_memory_ratio) as u64)
            .min(settings.cache_hard_cap_bytes);
        let cache_capacity_entries = (cache_capacity_bytes / settings.average_entry_bytes.max(1))
            as usize;
        let cache_capacity_entries =
            cache_capacity_entries.clamp(settings.min_cache_entries, settings.max_cache_entries);

        let config = RuntimeConfig {
            model: recommendation.descriptor.name.clone(),
            thread_count,
            context_window_tokens,
            use_memory_mapping: specs.storage_is_ssd,
            cache_capacity_entries,
            cache_capacity_bytes,
            request_timeout_seconds: settings.request_timeout_seconds,
        };

        debug!("Runtime config derived: {:?}", config);
        config
    }

    fn context_window(&self, recommendation: &ModelRecommendation) -> u32 {
        let floor = self.settings.min_context_tokens;
        let threshold = self.settings.context_pressure_threshold_bytes as i64;
        let headroom = recommendation.memory_headroom_bytes;

        let mut tokens = recommendation.descriptor.context_window_tokens.max(floor);
        if headroom < threshold {
            tokens /= 2;
        }
        if headroom < threshold / 2 {
            tokens /= 2;
        }
        tokens.max(floor)
    }
}
