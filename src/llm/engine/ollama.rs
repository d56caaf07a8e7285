//! Ollama engine: process management and HTTP API client
//!
//! The engine binary is spawned as `<binary> serve`, bound to the configured
//! loopback endpoint and limited to a single loaded model and a single
//! parallel request. When something is already answering on the endpoint it
//! is adopted instead, and left running on shutdown.

use super::backend::EngineBackend;
use crate::llm::error::LocalAiError;
use crate::llm::runtime::RuntimeConfig;
use crate::llm::types::{EngineRequest, EngineResponse, GenerationParams, ModelInfo};
use async_trait::async_trait;
use reqwest::{redirect, Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_BINARY: &str = "ollama";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const PULL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const ADOPT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse `endpoint` and reject anything outside the loopback interface
pub fn ensure_loopback(endpoint: &str) -> Result<Url, LocalAiError> {
    let non_local = || LocalAiError::NonLocalEndpoint {
        endpoint: endpoint.to_string(),
    };

    let url = Url::parse(endpoint).map_err(|_| non_local())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(non_local());
    }

    let is_loopback = match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    };

    if is_loopback {
        Ok(url)
    } else {
        Err(non_local())
    }
}

/// Supervised Ollama process plus its HTTP API
pub struct OllamaEngine {
    endpoint: Url,
    binary: String,
    http_client: Client,
    request_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl OllamaEngine {
    pub fn new(endpoint: &str, binary: impl Into<String>) -> Result<Self, LocalAiError> {
        Self::with_timeout(
            endpoint,
            binary,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        endpoint: &str,
        binary: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LocalAiError> {
        let endpoint = ensure_loopback(endpoint)?;
        // Traffic must stay on loopback: ignore HTTP(S)_PROXY and never follow redirects
        let http_client = Client::builder()
            .no_proxy()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| LocalAiError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            endpoint,
            binary: binary.into(),
            http_client,
            request_timeout,
            child: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.as_str().trim_end_matches('/'), path)
    }

    /// `host:port` form expected by `OLLAMA_HOST`
    fn bind_address(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or("127.0.0.1");
        let port = self.endpoint.port_or_known_default().unwrap_or(11434);
        format!("{}:{}", host, port)
    }

    fn map_transport_error(&self, e: reqwest::Error, timeout: Duration) -> LocalAiError {
        if e.is_timeout() {
            error!("Ollama request timed out after {:?}", timeout);
            LocalAiError::RequestTimeout { timeout }
        } else if e.is_connect() {
            error!("Cannot connect to Ollama at {}", self.endpoint);
            LocalAiError::Engine {
                message: format!("Connection failed: {}", e),
                status_code: None,
            }
        } else {
            error!("Ollama request error: {}", e);
            LocalAiError::Engine {
                message: format!("Request failed: {}", e),
                status_code: None,
            }
        }
    }

    async fn error_from_status(response: reqwest::Response, model: &str) -> LocalAiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        error!("Ollama API returned error status {}: {}", status, body);
        classify_error_status(status, &body, model)
    }

    fn spawn(&self) -> Result<Child, LocalAiError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("serve")
            .env("OLLAMA_HOST", self.bind_address())
            .env("OLLAMA_NUM_PARALLEL", "1")
            .env("OLLAMA_MAX_LOADED_MODELS", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        command.spawn().map_err(|e| {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                format!("engine binary '{}' not found in PATH", self.binary)
            } else {
                format!("failed to launch '{} serve': {}", self.binary, e)
            };
            error!("{}", reason);
            LocalAiError::EngineUnavailable {
                attempts: 1,
                reason,
            }
        })
    }
}

/// Map a non-success response to an error; a 404 about the model means it is not pulled
fn classify_error_status(status: StatusCode, body: &str, model: &str) -> LocalAiError {
    if status == StatusCode::NOT_FOUND && body.to_lowercase().contains("model") {
        return LocalAiError::ModelNotInstalled {
            model: model.to_string(),
        };
    }

    LocalAiError::Engine {
        message: format!("HTTP {}: {}", status, body),
        status_code: Some(status.as_u16()),
    }
}

#[cfg(unix)]
fn request_terminate(pid: u32) {
    // SAFETY: kill(2) with a pid we spawned and still own; no memory is shared
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn request_terminate(_pid: u32) {}

#[async_trait]
impl EngineBackend for OllamaEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn start(&self, config: &RuntimeConfig) -> Result<Option<u32>, LocalAiError> {
        let mut child = self.child.lock().await;

        if let Some(existing) = child.as_mut() {
            if matches!(existing.try_wait(), Ok(None)) {
                debug!("Ollama process already running, reusing it");
                return Ok(existing.id());
            }
            *child = None;
        }

        if self.probe(ADOPT_PROBE_TIMEOUT).await {
            info!(
                "Ollama already listening at {}, adopting it (model {})",
                self.endpoint, config.model
            );
            return Ok(None);
        }

        let spawned = self.spawn()?;
        let pid = spawned.id();
        info!(
            "Started '{} serve' on {} (pid {:?}, model {})",
            self.binary,
            self.bind_address(),
            pid,
            config.model
        );
        *child = Some(spawned);
        Ok(pid)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = self.url("/api/version");
        debug!("Probing Ollama at {}", url);

        match self.http_client.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    warn!("Ollama probe failed with status: {}", response.status());
                }
                healthy
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!("Ollama probe timed out");
                } else {
                    debug!("Ollama probe error: {}", e);
                }
                false
            }
        }
    }

    async fn generate(&self, request: &EngineRequest) -> Result<EngineResponse, LocalAiError> {
        let body = GenerateRequest::from_engine_request(request);

        debug!(
            "Sending request to Ollama: model={}, prompt_length={}",
            request.model,
            request.prompt.len()
        );

        let start = Instant::now();
        let response = self
            .http_client
            .post(self.url("/api/generate"))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, self.request_timeout))?;

        if !response.status().is_success() {
            return Err(Self::error_from_status(response, &request.model).await);
        }

        let generated: GenerateResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Ollama response: {}", e);
            LocalAiError::Engine {
                message: format!("JSON parse error: {}", e),
                status_code: None,
            }
        })?;

        if !generated.done {
            warn!("Ollama response indicates incomplete generation");
        }

        let elapsed = start.elapsed();
        info!(
            "Ollama generation completed in {:.2}s (model={})",
            elapsed.as_secs_f64(),
            request.model
        );

        Ok(EngineResponse {
            content: generated.response,
            model: request.model.clone(),
            eval_count: generated.eval_count,
            response_time: elapsed,
        })
    }

    async fn stop(&self, grace: Duration) -> Result<(), LocalAiError> {
        let Some(mut child) = self.child.lock().await.take() else {
            debug!("No spawned Ollama process to stop");
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Ollama process already exited: {}", status);
            return Ok(());
        }

        if let Some(pid) = child.id() {
            info!("Stopping Ollama (pid {})", pid);
            request_terminate(pid);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Ollama exited: {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(LocalAiError::Engine {
                message: format!("Failed waiting for engine exit: {}", e),
                status_code: None,
            }),
            Err(_) => {
                warn!("Ollama did not exit within {:?}, killing it", grace);
                child.kill().await.map_err(|e| LocalAiError::Engine {
                    message: format!("Failed to kill engine: {}", e),
                    status_code: None,
                })
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LocalAiError> {
        let response = self
            .http_client
            .get(self.url("/api/tags"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, self.request_timeout))?;

        if !response.status().is_success() {
            return Err(Self::error_from_status(response, "").await);
        }

        let tags: TagsResponse = response.json().await.map_err(|e| LocalAiError::Engine {
            message: format!("JSON parse error: {}", e),
            status_code: None,
        })?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size_bytes: m.size,
            })
            .collect())
    }

    async fn pull_model(&self, model: &str) -> Result<(), LocalAiError> {
        info!("Pulling model {} (this may take a while)", model);

        let response = self
            .http_client
            .post(self.url("/api/pull"))
            .timeout(PULL_TIMEOUT)
            .json(&PullRequest {
                model: model.to_string(),
                stream: false,
            })
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, PULL_TIMEOUT))?;

        if !response.status().is_success() {
            return Err(Self::error_from_status(response, model).await);
        }

        info!("Model {} pulled", model);
        Ok(())
    }
}

impl fmt::Debug for OllamaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaEngine")
            .field("endpoint", &self.endpoint.as_str())
            .field("binary", &self.binary)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Request body for `/api/generate`
#[derive(Debug, Clone, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    options: GenerateOptions,
}

/// Per-request runtime options
#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    num_thread: usize,
    num_ctx: u32,
    use_mmap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

impl GenerateRequest {
    fn from_engine_request(request: &EngineRequest) -> Self {
        let GenerationParams {
            system,
            temperature,
            top_p,
            max_tokens,
            stop_sequences,
        } = request.params.clone();

        Self {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            stream: false,
            system,
            options: GenerateOptions {
                num_thread: request.thread_count,
                num_ctx: request.context_window_tokens,
                use_mmap: request.use_memory_mapping,
                temperature,
                top_p,
                num_predict: max_tokens,
                stop: stop_sequences,
            },
        }
    }
}

/// Response body from `/api/generate`
#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Clone, Serialize)]
struct PullRequest {
    model: String,
    stream: bool,
}
