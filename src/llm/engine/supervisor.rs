//! Lifecycle management for the single inference engine process
//!
//! State machine:
//!
//! ```text
//! Stopped -> Starting -> Ready <-> Degraded -> Failed -> Starting ...
//! ```
//!
//! A failed health check moves `Ready` to `Degraded`; a passing one moves it
//! back. `failure_threshold` consecutive failures mark the engine `Failed`,
//! after which `ensure_ready` restarts it with exponential backoff until the
//! attempt budget is spent.
//!
//! Requests share one in-flight slot. The slot is a FIFO-fair async mutex, so
//! concurrent callers are served strictly in the order they arrived.

use super::backend::EngineBackend;
use super::state::{BackoffPolicy, EngineProcessState, EngineStatus};
use crate::llm::error::LocalAiError;
use crate::llm::runtime::RuntimeConfig;
use crate::llm::types::{EngineRequest, EngineResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Timeouts and limits for the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// How long `ensure_ready` waits for the engine to answer probes
    pub startup_timeout: Duration,
    /// Upper bound on a single liveness probe
    pub health_timeout: Duration,
    /// Time between SIGTERM and a forced kill
    pub shutdown_grace: Duration,
    /// Consecutive failed health checks before the engine is marked failed
    pub failure_threshold: u32,
    /// Pause between readiness probes during startup
    pub readiness_poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            health_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            failure_threshold: 3,
            readiness_poll_interval: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Owns the engine backend and its process state
pub struct InferenceEngineSupervisor {
    backend: Arc<dyn EngineBackend>,
    settings: SupervisorSettings,
    state: Mutex<EngineProcessState>,
    config: Mutex<Option<RuntimeConfig>>,
    /// Serializes start, restart and shutdown
    lifecycle: tokio::sync::Mutex<()>,
    /// The single in-flight request slot
    slot: tokio::sync::Mutex<()>,
}

impl InferenceEngineSupervisor {
    pub fn new(backend: Arc<dyn EngineBackend>, settings: SupervisorSettings) -> Self {
        Self {
            backend,
            settings,
            state: Mutex::new(EngineProcessState::default()),
            config: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            slot: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn EngineBackend> {
        &self.backend
    }

    /// Snapshot of the process state
    pub fn state(&self) -> EngineProcessState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.state.lock().status
    }

    /// Config the engine was last started with
    pub fn current_config(&self) -> Option<RuntimeConfig> {
        self.config.lock().clone()
    }

    /// Bring the engine to `Ready` running with `config`
    ///
    /// A stopped engine gets one start attempt. A failed engine is restarted
    /// with backoff until the attempt budget is spent, then `EngineUnavailable`
    /// is returned. A running engine with a different config is restarted once
    /// the in-flight request, if any, has finished.
    pub async fn ensure_ready(&self, config: &RuntimeConfig) -> Result<(), LocalAiError> {
        config.validate()?;
        let _lifecycle = self.lifecycle.lock().await;

        let status = self.status();
        let same_config = self.config.lock().as_ref() == Some(config);

        match status {
            EngineStatus::Ready | EngineStatus::Degraded if same_config => Ok(()),
            EngineStatus::Ready | EngineStatus::Degraded => {
                info!(
                    "Runtime config changed, restarting {} engine with model {}",
                    self.backend.name(),
                    config.model
                );
                let _slot = self.slot.lock().await;
                self.stop_backend(self.settings.shutdown_grace).await;
                self.start_once(config).await
            }
            EngineStatus::Stopped => self.start_once(config).await,
            EngineStatus::Starting => {
                // A previous start was abandoned mid-way
                self.stop_backend(self.settings.shutdown_grace).await;
                self.start_once(config).await
            }
            EngineStatus::Failed => self.restart_with_backoff(config).await,
        }
    }

    async fn start_once(&self, config: &RuntimeConfig) -> Result<(), LocalAiError> {
        self.state.lock().mark_starting();
        *self.config.lock() = Some(config.clone());

        info!(
            "Starting {} engine: model={}, threads={}, ctx={}, mmap={}",
            self.backend.name(),
            config.model,
            config.thread_count,
            config.context_window_tokens,
            config.use_memory_mapping
        );

        let pid = match self.backend.start(config).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("Engine failed to start: {}", e);
                self.state.lock().mark_failed();
                return Err(e);
            }
        };

        if self.wait_until_ready().await {
            self.state.lock().mark_ready(pid);
            info!("Engine ready (pid {:?})", pid);
            return Ok(());
        }

        error!(
            "Engine did not become ready within {:?}",
            self.settings.startup_timeout
        );
        self.stop_backend(self.settings.shutdown_grace).await;
        self.state.lock().mark_failed();
        Err(LocalAiError::EngineStartupTimeout {
            timeout: self.settings.startup_timeout,
        })
    }

    async fn wait_until_ready(&self) -> bool {
        let deadline = Instant::now() + self.settings.startup_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self
                .backend
                .probe(self.settings.health_timeout.min(remaining))
                .await
            {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(self.settings.readiness_poll_interval.min(remaining)).await;
        }
    }

    async fn restart_with_backoff(&self, config: &RuntimeConfig) -> Result<(), LocalAiError> {
        let policy = &self.settings.backoff;
        let mut last_error = None;

        loop {
            let attempt = {
                let mut state = self.state.lock();
                if state.restart_attempts >= policy.max_attempts {
                    break;
                }
                state.restart_attempts += 1;
                state.restart_attempts
            };

            let delay = policy.delay(attempt);
            warn!(
                "Restarting engine (attempt {}/{}) in {:?}",
                attempt, policy.max_attempts, delay
            );
            tokio::time::sleep(delay).await;

            self.stop_backend(self.settings.shutdown_grace).await;
            match self.start_once(config).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Restart attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "restart attempts exhausted".to_string());
        error!(
            "Engine unavailable after {} restart attempts: {}",
            policy.max_attempts, reason
        );
        Err(LocalAiError::EngineUnavailable {
            attempts: policy.max_attempts,
            reason,
        })
    }

    async fn stop_backend(&self, grace: Duration) {
        if let Err(e) = self.backend.stop(grace).await {
            warn!("Failed to stop engine cleanly: {}", e);
        }
    }

    fn ensure_serving(&self) -> Result<(), LocalAiError> {
        let state = self.state.lock();
        if state.status.can_serve() {
            Ok(())
        } else {
            Err(LocalAiError::EngineUnavailable {
                attempts: state.restart_attempts,
                reason: format!("engine is {}", state.status),
            })
        }
    }

    /// Forward one request, waiting for the in-flight slot
    ///
    /// `timeout` covers both the wait for the slot and the engine call. On
    /// timeout the request is abandoned but the engine keeps running.
    pub async fn submit(
        &self,
        request: &EngineRequest,
        timeout: Duration,
    ) -> Result<EngineResponse, LocalAiError> {
        let deadline = Instant::now() + timeout;

        let _slot = tokio::time::timeout_at(deadline, self.slot.lock())
            .await
            .map_err(|_| {
                warn!("Timed out after {:?} waiting for the engine slot", timeout);
                LocalAiError::RequestTimeout { timeout }
            })?;

        self.forward(request, deadline, timeout).await
    }

    /// Forward one request only if the slot is free, otherwise `EngineBusy`
    pub async fn try_submit(
        &self,
        request: &EngineRequest,
        timeout: Duration,
    ) -> Result<EngineResponse, LocalAiError> {
        let _slot = self.slot.try_lock().map_err(|_| LocalAiError::EngineBusy)?;
        self.forward(request, Instant::now() + timeout, timeout).await
    }

    async fn forward(
        &self,
        request: &EngineRequest,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<EngineResponse, LocalAiError> {
        self.ensure_serving()?;
        debug!(
            "Submitting request: model={}, prompt_length={}",
            request.model,
            request.prompt.len()
        );

        match tokio::time::timeout_at(deadline, self.backend.generate(request)).await {
            Ok(Err(e @ LocalAiError::Engine { status_code: None, .. })) => {
                self.check_after_transport_error(&e).await;
                Err(e)
            }
            Ok(result) => result,
            Err(_) => {
                warn!("Request to model {} timed out after {:?}", request.model, timeout);
                Err(LocalAiError::RequestTimeout { timeout })
            }
        }
    }

    /// A request failed below HTTP; mark the engine failed if it no longer answers probes
    async fn check_after_transport_error(&self, cause: &LocalAiError) {
        if self.backend.probe(self.settings.health_timeout).await {
            debug!("Engine still answers probes after request error: {}", cause);
            return;
        }

        error!("Engine stopped responding ({}), marking it failed", cause);
        self.state.lock().record_engine_lost();
    }

    /// Restart the engine if it is still `Failed` once the lifecycle lock is held
    ///
    /// Uses the config the engine was last started with, as read under the
    /// lock, so a concurrent model switch is never undone. Returns whether a
    /// restart succeeded.
    pub async fn restart_if_failed(&self) -> Result<bool, LocalAiError> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state.status != EngineStatus::Failed {
            return Ok(false);
        }
        if state.restart_attempts >= self.settings.backoff.max_attempts {
            debug!("Restart budget spent, leaving engine failed");
            return Ok(false);
        }

        let Some(config) = self.current_config() else {
            warn!("Engine failed but no config was ever applied, not restarting");
            return Ok(false);
        };

        self.restart_with_backoff(&config).await?;
        Ok(true)
    }

    /// Probe the engine and record the outcome
    ///
    /// Only a serving engine is probed; in any other status this returns
    /// `false` without touching the state.
    pub async fn health_check(&self) -> bool {
        if !self.status().can_serve() {
            return false;
        }

        let healthy = self.backend.probe(self.settings.health_timeout).await;

        let mut state = self.state.lock();
        if healthy {
            state.record_health_success();
            debug!("Engine health check passed");
        } else {
            let status = state.record_health_failure(self.settings.failure_threshold);
            match status {
                EngineStatus::Failed => error!(
                    "Engine failed {} consecutive health checks, marking it failed",
                    state.consecutive_failures
                ),
                _ => warn!(
                    "Engine health check failed ({}/{})",
                    state.consecutive_failures, self.settings.failure_threshold
                ),
            }
        }
        healthy
    }

    /// Stop the engine and return to `Stopped`
    ///
    /// Also clears the restart budget, so a later `ensure_ready` starts fresh.
    pub async fn shutdown(&self) -> Result<(), LocalAiError> {
        let _lifecycle = self.lifecycle.lock().await;
        info!("Shutting down {} engine", self.backend.name());

        let result = self.backend.stop(self.settings.shutdown_grace).await;
        *self.state.lock() = EngineProcessState::default();
        *self.config.lock() = None;
        result
    }
}

impl std::fmt::Debug for InferenceEngineSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngineSupervisor")
            .field("backend", &self.backend.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::engine::mock::MockEngine;
    use crate::llm::types::GenerationParams;

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_millis(100),
            health_timeout: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(20),
            failure_threshold: 3,
            readiness_poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(40),
                max_attempts: 3,
            },
        }
    }

    fn config(model: &str) -> RuntimeConfig {
        RuntimeConfig {
            model: model.to_string(),
            thread_count: 4,
            context_window_tokens: 4096,
            use_memory_mapping: true,
            cache_capacity_entries: 10,
            cache_capacity_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }

    fn supervisor(engine: &Arc<MockEngine>) -> InferenceEngineSupervisor {
        InferenceEngineSupervisor::new(engine.clone(), fast_settings())
    }

    #[tokio::test]
    async fn test_ensure_ready_starts_engine() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);

        supervisor.ensure_ready(&config("llama3.2:3b")).await.unwrap();

        let state = supervisor.state();
        assert_eq!(state.status, EngineStatus::Ready);
        assert!(state.pid.is_some());
        assert_eq!(supervisor.current_config(), Some(config("llama3.2:3b")));
        assert_eq!(engine.last_config(), Some(config("llama3.2:3b")));
    }

    #[tokio::test]
    async fn test_ensure_ready_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);

        supervisor.ensure_ready(&config("m")).await.unwrap();
        supervisor.ensure_ready(&config("m")).await.unwrap();

        assert_eq!(engine.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_config_change_restarts_engine() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);

        supervisor.ensure_ready(&config("a")).await.unwrap();
        supervisor.ensure_ready(&config("b")).await.unwrap();

        assert_eq!(engine.start_calls(), 2);
        assert!(engine.stop_calls() >= 1);
        assert_eq!(supervisor.current_config().unwrap().model, "b");
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let engine = Arc::new(MockEngine::new());
        engine.set_never_ready(true);
        let supervisor = supervisor(&engine);

        let err = supervisor.ensure_ready(&config("m")).await.unwrap_err();

        assert_eq!(
            err,
            LocalAiError::EngineStartupTimeout {
                timeout: Duration::from_millis(100)
            }
        );
        assert_eq!(supervisor.status(), EngineStatus::Failed);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_start_error_marks_failed() {
        let engine = Arc::new(MockEngine::new());
        engine.push_start_result(Err(LocalAiError::EngineUnavailable {
            attempts: 1,
            reason: "binary not found".to_string(),
        }));
        let supervisor = supervisor(&engine);

        assert!(supervisor.ensure_ready(&config("m")).await.is_err());
        assert_eq!(supervisor.status(), EngineStatus::Failed);

        // The next call restarts with backoff and succeeds
        supervisor.ensure_ready(&config("m")).await.unwrap();
        assert_eq!(supervisor.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_submit_requires_running_engine() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        let request = EngineRequest::new(&config("m"), "hi", GenerationParams::default());

        let err = supervisor
            .submit(&request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LocalAiError::EngineUnavailable { .. }));
        assert_eq!(engine.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_request_times_out_without_killing_engine() {
        let engine = Arc::new(MockEngine::new().with_response_delay(Duration::from_millis(200)));
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("m")).await.unwrap();
        let request = EngineRequest::new(&config("m"), "hi", GenerationParams::default());

        let err = supervisor
            .submit(&request, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LocalAiError::RequestTimeout {
                timeout: Duration::from_millis(20)
            }
        );
        assert!(engine.is_running());
        assert_eq!(engine.stop_calls(), 0);
        assert_eq!(supervisor.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_health_check_recovers_degraded() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("m")).await.unwrap();

        engine.push_probe_results([false]);
        assert!(!supervisor.health_check().await);
        assert_eq!(supervisor.status(), EngineStatus::Degraded);

        assert!(supervisor.health_check().await);
        assert_eq!(supervisor.status(), EngineStatus::Ready);
        assert_eq!(supervisor.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_health_check_skips_stopped_engine() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);

        assert!(!supervisor.health_check().await);
        assert_eq!(supervisor.status(), EngineStatus::Stopped);
        assert!(supervisor.state().last_health_check_at.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("m")).await.unwrap();

        supervisor.shutdown().await.unwrap();

        assert_eq!(supervisor.state(), EngineProcessState::default());
        assert!(supervisor.current_config().is_none());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_request_to_crashed_engine_marks_failed() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("m")).await.unwrap();
        engine.crash();
        let request = EngineRequest::new(&config("m"), "hi", GenerationParams::default());

        let err = supervisor
            .submit(&request, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, LocalAiError::Engine { status_code: None, .. }));
        assert_eq!(supervisor.status(), EngineStatus::Failed);
        assert_eq!(supervisor.state().pid, None);
    }

    #[tokio::test]
    async fn test_engine_error_with_status_keeps_ready() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("m")).await.unwrap();
        engine.push_response(Err(LocalAiError::Engine {
            message: "HTTP 500: out of memory".to_string(),
            status_code: Some(500),
        }));
        let request = EngineRequest::new(&config("m"), "hi", GenerationParams::default());

        assert!(supervisor.submit(&request, Duration::from_secs(1)).await.is_err());
        assert_eq!(supervisor.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_restart_if_failed_restarts_with_last_config() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        assert!(!supervisor.restart_if_failed().await.unwrap());

        supervisor.ensure_ready(&config("a")).await.unwrap();
        engine.crash();
        for _ in 0..3 {
            supervisor.health_check().await;
        }
        assert_eq!(supervisor.status(), EngineStatus::Failed);

        assert!(supervisor.restart_if_failed().await.unwrap());
        assert_eq!(supervisor.status(), EngineStatus::Ready);
        assert_eq!(engine.last_config(), Some(config("a")));
    }

    #[tokio::test]
    async fn test_restart_if_failed_never_undoes_model_switch() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        supervisor.ensure_ready(&config("a")).await.unwrap();
        engine.crash();
        for _ in 0..3 {
            supervisor.health_check().await;
        }

        // A switch to "b" wins the lifecycle lock first
        supervisor.ensure_ready(&config("b")).await.unwrap();
        let starts = engine.start_calls();

        assert!(!supervisor.restart_if_failed().await.unwrap());
        assert_eq!(supervisor.current_config(), Some(config("b")));
        assert_eq!(engine.last_config(), Some(config("b")));
        assert_eq!(engine.start_calls(), starts);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_start() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = supervisor(&engine);
        let invalid = RuntimeConfig {
            thread_count: 0,
            ..config("m")
        };

        assert!(matches!(
            supervisor.ensure_ready(&invalid).await,
            Err(LocalAiError::Config { .. })
        ));
        assert_eq!(engine.start_calls(), 0);
    }
}
