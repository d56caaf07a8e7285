//! Inference engine process supervision
//!
//! [`InferenceEngineSupervisor`] drives an [`EngineBackend`] through the
//! lifecycle in [`EngineStatus`]. [`OllamaEngine`] manages a real Ollama
//! process; [`MockEngine`] simulates one for tests.

mod backend;
mod mock;
mod monitor;
mod ollama;
mod state;
mod supervisor;

pub use backend::EngineBackend;
pub use mock::MockEngine;
pub use monitor::{HealthConfig, HealthMonitor};
pub use ollama::{ensure_loopback, OllamaEngine, DEFAULT_BINARY, DEFAULT_ENDPOINT};
pub use state::{BackoffPolicy, EngineProcessState, EngineStatus};
pub use supervisor::{InferenceEngineSupervisor, SupervisorSettings};
