//! Engine supervisor integration tests
//!
//! Drives the supervisor against the in-process mock engine: health
//! failures, restart with backoff, the attempt budget and request ordering.

use infrapilot::llm::{
    BackoffPolicy, EngineRequest, EngineStatus, GenerationParams, InferenceEngineSupervisor,
    LocalAiError, MockEngine, RuntimeConfig, SupervisorSettings,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout: Duration::from_millis(200),
        health_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(20),
        failure_threshold: 3,
        readiness_poll_interval: Duration::from_millis(5),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(80),
            max_attempts: 3,
        },
    }
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        model: "qwen2.5-coder:7b".to_string(),
        thread_count: 4,
        context_window_tokens: 8192,
        use_memory_mapping: true,
        cache_capacity_entries: 50,
        cache_capacity_bytes: 4 * 1024 * 1024,
        request_timeout_seconds: 30,
    }
}

fn start_failure() -> LocalAiError {
    LocalAiError::Engine {
        message: "address already in use".to_string(),
        status_code: None,
    }
}

async fn ready_supervisor(engine: &Arc<MockEngine>) -> Arc<InferenceEngineSupervisor> {
    let supervisor = Arc::new(InferenceEngineSupervisor::new(engine.clone(), settings()));
    supervisor.ensure_ready(&config()).await.unwrap();
    supervisor
}

async fn fail_health_checks(supervisor: &InferenceEngineSupervisor, engine: &MockEngine) {
    engine.crash();
    for _ in 0..3 {
        assert!(!supervisor.health_check().await);
    }
}

#[tokio::test]
async fn test_three_failed_checks_then_restart_with_backoff() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = ready_supervisor(&engine).await;

    engine.crash();
    assert!(!supervisor.health_check().await);
    assert_eq!(supervisor.status(), EngineStatus::Degraded);
    assert!(!supervisor.health_check().await);
    assert!(!supervisor.health_check().await);
    assert_eq!(supervisor.status(), EngineStatus::Failed);
    assert_eq!(supervisor.state().consecutive_failures, 3);

    // First restart attempt fails, the second succeeds
    engine.push_start_result(Err(start_failure()));
    let started = Instant::now();
    supervisor.ensure_ready(&config()).await.unwrap();
    let elapsed = started.elapsed();

    let backoff = &supervisor.settings().backoff;
    assert!(elapsed >= backoff.delay(1) + backoff.delay(2));
    assert_eq!(engine.start_calls(), 3);

    let state = supervisor.state();
    assert_eq!(state.status, EngineStatus::Ready);
    assert_eq!(state.restart_attempts, 0);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_restart_budget_exhausted() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = ready_supervisor(&engine).await;
    fail_health_checks(&supervisor, &engine).await;

    for _ in 0..3 {
        engine.push_start_result(Err(start_failure()));
    }

    let result = supervisor.ensure_ready(&config()).await;
    match result {
        Err(LocalAiError::EngineUnavailable { attempts, reason }) => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("address already in use"));
        }
        other => panic!("expected EngineUnavailable, got {:?}", other),
    }
    assert_eq!(engine.start_calls(), 4);
    assert_eq!(supervisor.status(), EngineStatus::Failed);

    // Budget stays spent: no further start attempts
    let again = supervisor.ensure_ready(&config()).await;
    assert!(matches!(again, Err(LocalAiError::EngineUnavailable { .. })));
    assert_eq!(engine.start_calls(), 4);

    // An explicit shutdown clears the budget
    supervisor.shutdown().await.unwrap();
    supervisor.ensure_ready(&config()).await.unwrap();
    assert_eq!(supervisor.status(), EngineStatus::Ready);
}

#[tokio::test]
async fn test_requests_served_in_arrival_order() {
    let engine = Arc::new(MockEngine::new().with_response_delay(Duration::from_millis(10)));
    let supervisor = ready_supervisor(&engine).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let supervisor = supervisor.clone();
        let request = EngineRequest::new(&config(), format!("prompt {}", i), GenerationParams::default());
        handles.push(tokio::spawn(async move {
            supervisor.submit(&request, Duration::from_secs(5)).await
        }));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected: Vec<String> = (0..5).map(|i| format!("prompt {}", i)).collect();
    assert_eq!(engine.prompts(), expected);
    assert_eq!(engine.max_in_flight(), 1);
}

#[tokio::test]
async fn test_try_submit_reports_busy() {
    let engine = Arc::new(MockEngine::new().with_response_delay(Duration::from_millis(100)));
    let supervisor = ready_supervisor(&engine).await;

    let first = {
        let supervisor = supervisor.clone();
        let request = EngineRequest::new(&config(), "slow", GenerationParams::default());
        tokio::spawn(async move { supervisor.submit(&request, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = EngineRequest::new(&config(), "eager", GenerationParams::default());
    let busy = supervisor.try_submit(&request, Duration::from_secs(5)).await;
    assert!(matches!(busy, Err(LocalAiError::EngineBusy)));
    assert!(busy.unwrap_err().is_recoverable());

    first.await.unwrap().unwrap();
    let response = supervisor
        .try_submit(&request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.content, "qwen2.5-coder:7b: eager");
}

#[tokio::test]
async fn test_queued_request_times_out_engine_keeps_running() {
    let engine = Arc::new(MockEngine::new().with_response_delay(Duration::from_millis(200)));
    let supervisor = ready_supervisor(&engine).await;

    let first = {
        let supervisor = supervisor.clone();
        let request = EngineRequest::new(&config(), "long", GenerationParams::default());
        tokio::spawn(async move { supervisor.submit(&request, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let request = EngineRequest::new(&config(), "queued", GenerationParams::default());
    let result = supervisor.submit(&request, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(LocalAiError::RequestTimeout { .. })));

    assert!(engine.is_running());
    assert_eq!(supervisor.status(), EngineStatus::Ready);
    assert!(first.await.unwrap().is_ok());
    assert_eq!(engine.stop_calls(), 0);
}
