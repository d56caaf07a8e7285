//! Error taxonomy for local inference
//!
//! Every fallible public operation in [`crate::llm`] returns [`LocalAiError`].
//! Transport and process errors are mapped into these variants before they
//! leave the engine layer, so callers never see raw `reqwest` or `io` errors.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the local inference core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalAiError {
    /// CPU or memory information could not be read at all
    #[error("Hardware detection failed: {message}")]
    HardwareDetection { message: String },

    /// Not even the smallest catalog model can run on this host
    #[error(
        "Insufficient hardware: {available_bytes} bytes available, smallest model needs at least {required_bytes} bytes"
    )]
    InsufficientHardware {
        available_bytes: u64,
        required_bytes: u64,
    },

    /// The selected model is not present in the engine's model store
    #[error("Model '{model}' is not installed")]
    ModelNotInstalled { model: String },

    /// The engine process did not become ready in time
    #[error("Inference engine did not become ready within {}s", .timeout.as_secs())]
    EngineStartupTimeout { timeout: Duration },

    /// The single in-flight slot is taken (non-blocking submit only)
    #[error("Inference engine is busy with another request")]
    EngineBusy,

    /// Restart attempts are exhausted or the engine cannot be launched
    #[error("Inference engine unavailable after {attempts} attempt(s): {reason}")]
    EngineUnavailable { attempts: u32, reason: String },

    /// A request did not complete within its deadline
    #[error("Request timed out after {}s", .timeout.as_secs_f64())]
    RequestTimeout { timeout: Duration },

    /// The engine answered a single request with an error
    #[error("Inference engine error: {message}")]
    Engine {
        message: String,
        status_code: Option<u16>,
    },

    /// An endpoint outside the loopback interface was configured
    #[error("Endpoint '{endpoint}' is not a loopback address")]
    NonLocalEndpoint { endpoint: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl LocalAiError {
    /// Whether the caller can reasonably retry or fix the condition and try again
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LocalAiError::ModelNotInstalled { .. }
                | LocalAiError::EngineStartupTimeout { .. }
                | LocalAiError::EngineBusy
                | LocalAiError::RequestTimeout { .. }
                | LocalAiError::Engine { .. }
        )
    }

    /// Suggested next step for the user, when one exists
    pub fn remediation(&self) -> Option<String> {
        match self {
            LocalAiError::ModelNotInstalled { model } => {
                Some(format!("Model not installed - run: ollama pull {}", model))
            }
            LocalAiError::EngineStartupTimeout { .. } => Some(
                "The engine is still loading; retry, or raise INFRAPILOT_STARTUP_TIMEOUT"
                    .to_string(),
            ),
            LocalAiError::EngineBusy => Some("Retry once the current request finishes".to_string()),
            LocalAiError::EngineUnavailable { .. } => Some(
                "Check that the engine binary is installed (INFRAPILOT_ENGINE_BINARY) and inspect its logs"
                    .to_string(),
            ),
            LocalAiError::InsufficientHardware { .. } => Some(
                "Free memory by closing other applications, or run on a host with more RAM"
                    .to_string(),
            ),
            LocalAiError::NonLocalEndpoint { .. } => Some(
                "Point INFRAPILOT_ENGINE_ENDPOINT at localhost or 127.0.0.1".to_string(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_not_installed_is_recoverable_with_remediation() {
        let err = LocalAiError::ModelNotInstalled {
            model: "llama3.2:3b".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(err.remediation().unwrap().contains("ollama pull llama3.2:3b"));
    }

    #[test]
    fn test_fatal_errors() {
        let err = LocalAiError::InsufficientHardware {
            available_bytes: 1,
            required_bytes: 2,
        };
        assert!(!err.is_recoverable());

        let err = LocalAiError::EngineUnavailable {
            attempts: 5,
            reason: "spawn failed".to_string(),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("5 attempt(s)"));
    }

    #[test]
    fn test_timeout_display() {
        let err = LocalAiError::EngineStartupTimeout {
            timeout: Duration::from_secs(60),
        };
        assert_eq!(
            err.to_string(),
            "Inference engine did not become ready within 60s"
        );
    }
}
