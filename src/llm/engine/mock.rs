use super::backend::EngineBackend;
use crate::llm::error::LocalAiError;
use crate::llm::runtime::RuntimeConfig;
use crate::llm::types::{EngineRequest, EngineResponse, ModelInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Scriptable in-process engine for tests and offline use
///
/// By default every start succeeds, every probe passes while the engine is
/// running, and `generate` answers `"<model>: <prompt>"`. A stopped or
/// crashed engine refuses connections. Behavior can be queued per call.
pub struct MockEngine {
    running: AtomicBool,
    never_ready: AtomicBool,
    start_results: Mutex<VecDeque<Result<(), LocalAiError>>>,
    probe_results: Mutex<VecDeque<bool>>,
    responses: Mutex<VecDeque<Result<String, LocalAiError>>>,
    installed: Mutex<Option<BTreeSet<String>>>,
    response_delay: Mutex<Duration>,
    last_config: Mutex<Option<RuntimeConfig>>,
    prompts: Mutex<Vec<String>>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    generate_calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    next_pid: AtomicU32,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            never_ready: AtomicBool::new(false),
            start_results: Mutex::new(VecDeque::new()),
            probe_results: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            installed: Mutex::new(None),
            response_delay: Mutex::new(Duration::ZERO),
            last_config: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            generate_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            next_pid: AtomicU32::new(4000),
        }
    }

    /// Restrict the installed model set; unknown models fail with `ModelNotInstalled`
    pub fn with_installed_models<I, S>(self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.installed.lock() = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_response_delay(self, delay: Duration) -> Self {
        *self.response_delay.lock() = delay;
        self
    }

    /// Queue the outcome of the next `start` calls
    pub fn push_start_result(&self, result: Result<(), LocalAiError>) {
        self.start_results.lock().push_back(result);
    }

    /// Queue the outcome of the next probes; afterwards probes report whether the engine runs
    pub fn push_probe_results(&self, results: impl IntoIterator<Item = bool>) {
        self.probe_results.lock().extend(results);
    }

    pub fn push_response(&self, response: Result<String, LocalAiError>) {
        self.responses.lock().push_back(response);
    }

    /// Started engines never pass a probe
    pub fn set_never_ready(&self, never_ready: bool) {
        self.never_ready.store(never_ready, Ordering::SeqCst);
    }

    /// Simulate the process dying underneath the supervisor
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `generate` calls observed running at once
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Prompts in the order the engine began processing them
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn last_config(&self) -> Option<RuntimeConfig> {
        self.last_config.lock().clone()
    }

    fn check_installed(&self, model: &str) -> Result<(), LocalAiError> {
        match self.installed.lock().as_ref() {
            Some(models) if !models.contains(model) => Err(LocalAiError::ModelNotInstalled {
                model: model.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter even when the request future is dropped
struct InFlightGuard<'a>(&'a AtomicU32);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineBackend for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, config: &RuntimeConfig) -> Result<Option<u32>, LocalAiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());

        let queued = self.start_results.lock().pop_front();
        if let Some(Err(e)) = queued {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(Some(self.next_pid.fetch_add(1, Ordering::SeqCst)))
    }

    async fn probe(&self, _timeout: Duration) -> bool {
        if let Some(result) = self.probe_results.lock().pop_front() {
            return result;
        }
        self.is_running() && !self.never_ready.load(Ordering::SeqCst)
    }

    async fn generate(&self, request: &EngineRequest) -> Result<EngineResponse, LocalAiError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_running() {
            return Err(LocalAiError::Engine {
                message: "Connection failed: connection refused".to_string(),
                status_code: None,
            });
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        let started = Instant::now();
        self.check_installed(&request.model)?;

        let delay = *self.response_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self.responses.lock().pop_front();
        let content = match queued {
            Some(result) => result?,
            None => format!("{}: {}", request.model, request.prompt),
        };

        Ok(EngineResponse::text(
            content,
            request.model.clone(),
            started.elapsed(),
        ))
    }

    async fn stop(&self, _grace: Duration) -> Result<(), LocalAiError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LocalAiError> {
        Ok(self
            .installed
            .lock()
            .iter()
            .flatten()
            .map(|name| ModelInfo {
                name: name.clone(),
                size_bytes: 0,
            })
            .collect())
    }

    async fn pull_model(&self, model: &str) -> Result<(), LocalAiError> {
        if let Some(models) = self.installed.lock().as_mut() {
            models.insert(model.to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("running", &self.is_running())
            .field("start_calls", &self.start_calls())
            .field("generate_calls", &self.generate_calls())
            .finish()
    }
}
