//! Façade over hardware detection, model selection, the engine and the cache
//!
//! [`LocalAIClient`] owns every piece of mutable state explicitly; several
//! clients can coexist in one process without sharing anything.
//!
//! The active selection sits behind an async reader-writer lock. `generate`
//! holds a read guard for the whole request, so any number of callers can
//! hit the cache concurrently. `switch_model` takes the write guard: it waits
//! for in-flight requests, empties the cache and restarts the engine before
//! any new request can observe the new model.

use super::cache::{CacheStats, Fingerprint, ResponseCache};
use super::catalog::ModelCatalog;
use super::engine::{
    EngineBackend, EngineProcessState, EngineStatus, HealthConfig, HealthMonitor, InferenceEngineSupervisor,
    OllamaEngine, SupervisorSettings,
};
use super::error::LocalAiError;
use super::hardware::{HardwareProbe, HardwareProfiler, HardwareSpecs};
use super::runtime::{RuntimeConfig, RuntimeConfigurator};
use super::selector::{ModelRecommendation, ModelSelector};
use super::types::{EngineRequest, GenerationParams, ModelInfo};
use crate::config::InfrapilotConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Read-only diagnostics for the surrounding CLI
#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    pub specs: HardwareSpecs,
    pub recommendation: ModelRecommendation,
    pub runtime_config: RuntimeConfig,
    pub engine: EngineProcessState,
    pub cache: CacheStats,
}

#[derive(Debug, Clone)]
struct ActiveSelection {
    specs: HardwareSpecs,
    recommendation: ModelRecommendation,
    config: RuntimeConfig,
}

pub struct LocalAIClient {
    probe: Arc<dyn HardwareProbe>,
    selector: ModelSelector,
    configurator: RuntimeConfigurator,
    supervisor: Arc<InferenceEngineSupervisor>,
    cache: Arc<ResponseCache>,
    health: HealthConfig,
    active: RwLock<ActiveSelection>,
}

impl LocalAIClient {
    /// Client backed by the host's hardware, the builtin catalog and Ollama
    pub fn from_config(config: &InfrapilotConfig) -> Result<Self, LocalAiError> {
        config.validate()?;
        let backend = OllamaEngine::with_timeout(
            &config.engine_endpoint,
            config.engine_binary.clone(),
            config.request_timeout(),
        )?;

        Self::new(
            config,
            Arc::new(HardwareProfiler::new()),
            ModelCatalog::builtin(),
            Arc::new(backend),
        )
    }

    pub fn new(
        config: &InfrapilotConfig,
        probe: Arc<dyn HardwareProbe>,
        catalog: ModelCatalog,
        backend: Arc<dyn EngineBackend>,
    ) -> Result<Self, LocalAiError> {
        config.validate()?;
        Ok(Self::with_components(
            probe,
            ModelSelector::new(catalog, config.selection_policy()),
            RuntimeConfigurator::new(config.configurator_settings()),
            backend,
            config.supervisor_settings(),
            config.cache_ttl(),
        )?
        .with_health_config(config.health_config()))
    }

    /// Assemble a client from explicit parts
    ///
    /// Detects hardware and selects a model immediately. The engine itself is
    /// started lazily by the first request that misses the cache.
    pub fn with_components(
        probe: Arc<dyn HardwareProbe>,
        selector: ModelSelector,
        configurator: RuntimeConfigurator,
        backend: Arc<dyn EngineBackend>,
        supervisor_settings: SupervisorSettings,
        cache_ttl: Duration,
    ) -> Result<Self, LocalAiError> {
        let specs = probe.detect()?;
        let recommendation = selector.select(&specs)?;
        let config = configurator.configure(&specs, &recommendation);
        config.validate()?;

        info!(
            "Local AI ready to start: model={} tier={} threads={} ctx={} cache={} entries",
            config.model,
            recommendation.performance_tier,
            config.thread_count,
            config.context_window_tokens,
            config.cache_capacity_entries
        );

        let cache = Arc::new(ResponseCache::from_config(&config, cache_ttl));
        let supervisor = Arc::new(InferenceEngineSupervisor::new(backend, supervisor_settings));

        Ok(Self {
            probe,
            selector,
            configurator,
            supervisor,
            cache,
            health: HealthConfig::default(),
            active: RwLock::new(ActiveSelection {
                specs,
                recommendation,
                config,
            }),
        })
    }

    /// Settings used by [`Self::start_health_monitor`]
    pub fn with_health_config(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    pub fn supervisor(&self) -> &Arc<InferenceEngineSupervisor> {
        &self.supervisor
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub async fn active_model(&self) -> String {
        self.active.read().await.config.model.clone()
    }

    pub async fn runtime_config(&self) -> RuntimeConfig {
        self.active.read().await.config.clone()
    }

    pub async fn recommendation(&self) -> ModelRecommendation {
        self.active.read().await.recommendation.clone()
    }

    /// Generate a response, serving identical requests from the cache
    pub async fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<String, LocalAiError> {
        let active = self.active.read().await;
        let config = &active.config;

        let fingerprint = Fingerprint::compute(&config.model, prompt, &params);
        if let Some(cached) = self.cache.get(&fingerprint) {
            debug!("Serving response for {} from cache", config.model);
            return Ok(cached);
        }

        let request = EngineRequest::new(config, prompt, params);
        let timeout = Duration::from_secs(config.request_timeout_seconds);

        self.supervisor.ensure_ready(config).await?;
        let response = match self.supervisor.submit(&request, timeout).await {
            Err(e) if self.supervisor.status() == EngineStatus::Failed => {
                // Engine died under the request: restart within the backoff budget, retry once
                warn!("Engine lost during request ({}), restarting", e);
                self.supervisor.ensure_ready(config).await?;
                self.supervisor.submit(&request, timeout).await?
            }
            result => result?,
        };

        self.cache.put(fingerprint, response.content.clone());
        Ok(response.content)
    }

    /// Make `selection` the active model
    ///
    /// Re-derives the runtime config, empties the cache and restarts the
    /// engine. On return the cache is empty and the engine is either ready
    /// with the new model or the restart error is returned.
    pub async fn switch_model(
        &self,
        selection: ModelRecommendation,
    ) -> Result<RuntimeConfig, LocalAiError> {
        let mut active = self.active.write().await;
        let specs = active.specs.clone();
        self.apply_selection(&mut active, specs, selection).await
    }

    /// Switch to a catalog model by name
    pub async fn switch_to(&self, model: &str) -> Result<RuntimeConfig, LocalAiError> {
        let mut active = self.active.write().await;
        let selection = self.selector.recommend_named(model, &active.specs)?;
        let specs = active.specs.clone();
        self.apply_selection(&mut active, specs, selection).await
    }

    async fn apply_selection(
        &self,
        active: &mut ActiveSelection,
        specs: HardwareSpecs,
        selection: ModelRecommendation,
    ) -> Result<RuntimeConfig, LocalAiError> {
        let config = self.configurator.configure(&specs, &selection);
        config.validate()?;

        info!(
            "Switching model {} -> {}",
            active.config.model, config.model
        );

        self.cache
            .reset(config.cache_capacity_entries, config.cache_capacity_bytes);
        *active = ActiveSelection {
            specs,
            recommendation: selection,
            config: config.clone(),
        };

        self.supervisor.ensure_ready(&config).await?;
        Ok(config)
    }

    /// Re-detect hardware and switch models if the best choice changed
    ///
    /// Small fluctuations in available memory are ignored. Returns whether
    /// the active model changed.
    pub async fn refresh_hardware(&self) -> Result<bool, LocalAiError> {
        let specs = self.probe.detect()?;
        let mut active = self.active.write().await;

        if !self.selector.needs_reselection(&active.specs, &specs) {
            debug!(
                "Available memory {:.1}GB within hysteresis, keeping {}",
                specs.available_memory_gb(),
                active.config.model
            );
            return Ok(false);
        }

        let recommendation = self.selector.select(&specs)?;
        if recommendation.descriptor.name == active.config.model {
            info!(
                "Hardware changed but {} is still the best fit",
                active.config.model
            );
            active.specs = specs;
            active.recommendation = recommendation;
            return Ok(false);
        }

        self.apply_selection(&mut active, specs, recommendation)
            .await?;
        Ok(true)
    }

    /// Snapshot of hardware, selection, runtime config, engine state and cache
    pub async fn hardware_info(&self) -> HardwareInfo {
        let active = self.active.read().await;
        HardwareInfo {
            specs: active.specs.clone(),
            recommendation: active.recommendation.clone(),
            runtime_config: active.config.clone(),
            engine: self.supervisor.state(),
            cache: self.cache.stats(),
        }
    }

    /// Models present in the engine's local store
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LocalAiError> {
        self.ensure_engine().await?;
        self.supervisor.backend().list_models().await
    }

    pub async fn is_model_installed(&self, model: &str) -> Result<bool, LocalAiError> {
        let latest = format!("{}:latest", model);
        Ok(self
            .list_models()
            .await?
            .iter()
            .any(|m| m.name == model || m.name == latest))
    }

    /// Download a model into the engine's store
    pub async fn pull_model(&self, model: &str) -> Result<(), LocalAiError> {
        self.ensure_engine().await?;
        self.supervisor.backend().pull_model(model).await
    }

    async fn ensure_engine(&self) -> Result<(), LocalAiError> {
        let active = self.active.read().await;
        self.supervisor.ensure_ready(&active.config).await
    }

    /// Periodically probe the engine in the background, restarting it on failure
    /// when the health config allows
    pub fn start_health_monitor(&self) -> HealthMonitor {
        debug!(
            "Starting health monitor every {:?} (auto_restart={})",
            self.health.check_interval, self.health.auto_restart
        );
        HealthMonitor::start(self.supervisor.clone(), self.health.clone())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Stop the engine; the cache is kept
    pub async fn shutdown(&self) -> Result<(), LocalAiError> {
        self.supervisor.shutdown().await
    }
}

impl std::fmt::Debug for LocalAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAIClient")
            .field("supervisor", &self.supervisor)
            .field("cache", &self.cache.stats())
            .finish()
    }
}
