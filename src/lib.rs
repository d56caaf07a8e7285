//! infrapilot - hardware-aware local LLM inference
//!
//! infrapilot profiles the host, picks the largest catalog model the machine
//! can run comfortably, derives runtime parameters for it, and supervises a
//! local inference engine (Ollama) behind a response cache.
//!
//! # Example
//!
//! ```no_run
//! use infrapilot::{GenerationParams, InfrapilotConfig, LocalAIClient};
//!
//! # async fn run() -> Result<(), infrapilot::LocalAiError> {
//! let config = InfrapilotConfig::default();
//! config.validate()?;
//!
//! let client = LocalAIClient::from_config(&config)?;
//! let answer = client
//!     .generate("Summarize the release notes", GenerationParams::default())
//!     .await?;
//! println!("{}", answer);
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod llm;
pub mod util;

pub use config::{ConfigError, InfrapilotConfig};
pub use llm::{
    EngineStatus, GenerationParams, HardwareInfo, HardwareSpecs, LocalAIClient, LocalAiError,
    ModelCatalog, ModelRecommendation, ModelSelector, PerformanceTier, ResponseCache,
    RuntimeConfig,
};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");
