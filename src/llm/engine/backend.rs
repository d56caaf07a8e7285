use crate::llm::error::LocalAiError;
use crate::llm::runtime::RuntimeConfig;
use crate::llm::types::{EngineRequest, EngineResponse, ModelInfo};
use async_trait::async_trait;
use std::time::Duration;

/// A local inference engine the supervisor can drive
///
/// Implementations only launch, probe, query and stop the engine. Readiness
/// polling, health accounting and restarts belong to the supervisor.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the engine for `config`
    ///
    /// Returns the pid of a spawned process, or `None` when an engine that is
    /// already listening was adopted.
    async fn start(&self, config: &RuntimeConfig) -> Result<Option<u32>, LocalAiError>;

    /// Lightweight liveness probe, bounded by `timeout`
    async fn probe(&self, timeout: Duration) -> bool;

    async fn generate(&self, request: &EngineRequest) -> Result<EngineResponse, LocalAiError>;

    /// Ask the engine to exit, forcing termination after `grace`
    async fn stop(&self, grace: Duration) -> Result<(), LocalAiError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LocalAiError>;

    async fn pull_model(&self, model: &str) -> Result<(), LocalAiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticEngine;

    #[async_trait]
    impl EngineBackend for StaticEngine {
        fn name(&self) -> &str {
            "static"
        }

        async fn start(&self, _config: &RuntimeConfig) -> Result<Option<u32>, LocalAiError> {
            Ok(None)
        }

        async fn probe(&self, _timeout: Duration) -> bool {
            true
        }

        async fn generate(&self, request: &EngineRequest) -> Result<EngineResponse, LocalAiError> {
            Ok(EngineResponse::text(
                "ok",
                request.model.clone(),
                Duration::from_millis(1),
            ))
        }

        async fn stop(&self, _grace: Duration) -> Result<(), LocalAiError> {
            Ok(())
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, LocalAiError> {
            Ok(Vec::new())
        }

        async fn pull_model(&self, _model: &str) -> Result<(), LocalAiError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backend_is_object_safe() {
        let engine: Box<dyn EngineBackend> = Box::new(StaticEngine);
        assert_eq!(engine.name(), "static");
        assert!(engine.probe(Duration::from_millis(10)).await);
        assert!(engine.list_models().await.unwrap().is_empty());
    }
}
