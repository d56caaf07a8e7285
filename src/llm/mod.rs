//! Hardware-aware local inference
//!
//! Hardware is profiled once, the best catalog model for it is selected, a
//! runtime configuration is derived from both, and a supervised local engine
//! serves requests through a bounded response cache. [`LocalAIClient`] ties
//! the pieces together.

mod cache;
mod catalog;
mod client;
pub mod engine;
mod error;
mod hardware;
mod runtime;
mod selector;
mod types;

pub use cache::{CacheEntry, CacheStats, Fingerprint, ResponseCache, DEFAULT_CACHE_TTL};
pub use catalog::{ModelCatalog, ModelDescriptor, Quantization};
pub use client::{HardwareInfo, LocalAIClient};
pub use engine::{
    BackoffPolicy, EngineBackend, EngineProcessState, EngineStatus, HealthConfig, HealthMonitor,
    InferenceEngineSupervisor, MockEngine, OllamaEngine, SupervisorSettings,
};
pub use error::LocalAiError;
pub use hardware::{HardwareProbe, HardwareProfiler, HardwareSpecs, StaticProbe};
pub use runtime::{ConfiguratorSettings, RuntimeConfig, RuntimeConfigurator};
pub use selector::{
    needs_reselection, ModelRecommendation, ModelSelector, PerformanceTier, SelectionPolicy,
    SelectionWarning,
};
pub use types::{EngineRequest, EngineResponse, GenerationParams, ModelInfo};
