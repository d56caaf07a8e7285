use super::state::EngineStatus;
use super::supervisor::InferenceEngineSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Restart a failed engine with its last applied config
    pub auto_restart: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            auto_restart: true,
        }
    }
}

/// Background task that periodically probes the engine
pub struct HealthMonitor {
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn start(supervisor: Arc<InferenceEngineSupervisor>, config: HealthConfig) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            loop {
                ticker.tick().await;

                supervisor.health_check().await;

                if !config.auto_restart || supervisor.status() != EngineStatus::Failed {
                    continue;
                }

                match supervisor.restart_if_failed().await {
                    Ok(true) => info!("engine restarted by health monitor"),
                    Ok(false) => {}
                    Err(e) => warn!("failed to restart engine: {}", e),
                }
            }
        });

        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::engine::mock::MockEngine;
    use crate::llm::engine::state::BackoffPolicy;
    use crate::llm::engine::supervisor::SupervisorSettings;
    use crate::llm::runtime::RuntimeConfig;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_millis(100),
            health_timeout: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(20),
            failure_threshold: 2,
            readiness_poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
                max_attempts: 3,
            },
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            model: "llama3.2:1b".to_string(),
            thread_count: 2,
            context_window_tokens: 2048,
            use_memory_mapping: true,
            cache_capacity_entries: 10,
            cache_capacity_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }

    #[tokio::test]
    async fn test_health_config_default() {
        let cfg = HealthConfig::default();
        assert!(cfg.auto_restart);
        assert_eq!(cfg.check_interval, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_monitor_restarts_crashed_engine() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = Arc::new(InferenceEngineSupervisor::new(engine.clone(), settings()));
        supervisor.ensure_ready(&config()).await.unwrap();

        engine.crash();
        let monitor = HealthMonitor::start(
            supervisor.clone(),
            HealthConfig {
                check_interval: Duration::from_millis(10),
                auto_restart: true,
            },
        );
        assert!(monitor.is_running());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while engine.start_calls() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        monitor.stop().await;

        assert!(engine.start_calls() >= 2);
        assert!(engine.is_running());
    }

    #[tokio::test]
    async fn test_monitor_without_auto_restart_leaves_engine_failed() {
        let engine = Arc::new(MockEngine::new());
        let supervisor = Arc::new(InferenceEngineSupervisor::new(engine.clone(), settings()));
        supervisor.ensure_ready(&config()).await.unwrap();

        engine.crash();
        let monitor = HealthMonitor::start(
            supervisor.clone(),
            HealthConfig {
                check_interval: Duration::from_millis(10),
                auto_restart: false,
            },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while supervisor.status() != EngineStatus::Failed && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        monitor.stop().await;

        assert_eq!(supervisor.status(), EngineStatus::Failed);
        assert_eq!(engine.start_calls(), 1);
    }
}
