//! Lifecycle state of the inference engine process

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Coarse lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Stopped,
    Starting,
    Ready,
    /// Healthy enough to serve but at least one recent health check failed
    Degraded,
    Failed,
}

impl EngineStatus {
    /// Whether requests may be forwarded in this status
    pub fn can_serve(&self) -> bool {
        matches!(self, EngineStatus::Ready | EngineStatus::Degraded)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineStatus::Stopped => "stopped",
            EngineStatus::Starting => "starting",
            EngineStatus::Ready => "ready",
            EngineStatus::Degraded => "degraded",
            EngineStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Snapshot of the supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineProcessState {
    pub status: EngineStatus,
    /// Present only while a process we spawned is alive
    pub pid: Option<u32>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Restarts attempted since the engine last reached Ready
    pub restart_attempts: u32,
}

impl Default for EngineProcessState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Stopped,
            pid: None,
            last_health_check_at: None,
            consecutive_failures: 0,
            restart_attempts: 0,
        }
    }
}

impl EngineProcessState {
    pub fn mark_starting(&mut self) {
        self.status = EngineStatus::Starting;
        self.pid = None;
    }

    pub fn mark_ready(&mut self, pid: Option<u32>) {
        self.status = EngineStatus::Ready;
        self.pid = pid;
        self.consecutive_failures = 0;
        self.restart_attempts = 0;
        self.last_health_check_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = EngineStatus::Failed;
        self.pid = None;
    }

    /// Record a successful health check; Degraded recovers to Ready
    pub fn record_health_success(&mut self) {
        self.last_health_check_at = Some(Utc::now());
        self.consecutive_failures = 0;
        if self.status == EngineStatus::Degraded {
            self.status = EngineStatus::Ready;
        }
    }

    /// Record a failed health check, returning the new status
    pub fn record_health_failure(&mut self, failure_threshold: u32) -> EngineStatus {
        self.last_health_check_at = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.status.can_serve() {
            self.status = if self.consecutive_failures >= failure_threshold {
                EngineStatus::Failed
            } else {
                EngineStatus::Degraded
            };
        }
        self.status
    }

    /// The engine stopped answering mid-request and a follow-up probe failed
    pub fn record_engine_lost(&mut self) {
        self.last_health_check_at = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.status.can_serve() {
            self.status = EngineStatus::Failed;
            self.pid = None;
        }
    }
}

/// Exponential restart backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart attempt `attempt` (1-based): base, 2x base, 4x base, capped at max
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        first = { 1, 1 },
        second = { 2, 2 },
        third = { 3, 4 },
        fourth = { 4, 8 },
        fifth = { 5, 16 },
        capped = { 6, 30 },
        far_out = { 40, 30 },
    )]
    fn test_backoff_delay(attempt: u32, expected_secs: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_three_failures_mark_failed() {
        let mut state = EngineProcessState::default();
        state.mark_ready(Some(42));

        assert_eq!(state.record_health_failure(3), EngineStatus::Degraded);
        assert_eq!(state.record_health_failure(3), EngineStatus::Degraded);
        assert_eq!(state.record_health_failure(3), EngineStatus::Failed);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_success_recovers_degraded() {
        let mut state = EngineProcessState::default();
        state.mark_ready(None);
        state.record_health_failure(3);

        state.record_health_success();

        assert_eq!(state.status, EngineStatus::Ready);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_health_check_at.is_some());
    }

    #[test]
    fn test_failure_while_stopped_keeps_status() {
        let mut state = EngineProcessState::default();
        assert_eq!(state.record_health_failure(3), EngineStatus::Stopped);
    }

    #[test]
    fn test_ready_resets_counters() {
        let mut state = EngineProcessState {
            restart_attempts: 3,
            consecutive_failures: 2,
            ..Default::default()
        };
        state.mark_ready(Some(7));

        assert_eq!(state.restart_attempts, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.pid, Some(7));
    }

    #[test]
    fn test_engine_lost_fails_immediately() {
        let mut state = EngineProcessState::default();
        state.mark_ready(Some(9));

        state.record_engine_lost();
        assert_eq!(state.status, EngineStatus::Failed);
        assert_eq!(state.pid, None);
        assert_eq!(state.consecutive_failures, 1);

        let mut stopped = EngineProcessState::default();
        stopped.record_engine_lost();
        assert_eq!(stopped.status, EngineStatus::Stopped);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&EngineStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
