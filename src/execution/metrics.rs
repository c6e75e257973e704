//! Engine-wide counters and the optional external metrics sink.

use super::result::ExecutionResult;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const EXECUTIONS_TOTAL: &str = "executions_total";
pub const EXECUTION_DURATION_MS: &str = "execution_duration_ms";
pub const STEPS_TOTAL: &str = "steps_total";
pub const STEP_RETRIES_TOTAL: &str = "step_retries_total";
pub const ACTIVE_EXECUTIONS: &str = "active_executions";

/// Sink for counters, histograms, gauges and timings.
///
/// Every method is a no-op unless overridden.
pub trait MetricsCollector: Send + Sync {
    fn increment(&self, _name: &str, _value: u64, _tags: &[(&str, &str)]) {}

    fn histogram(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}

    fn timing(&self, _name: &str, _duration: Duration, _tags: &[(&str, &str)]) {}
}

/// Collector that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {}

/// Aggregated counters across every execution an engine has run
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub executions_total: AtomicU64,
    pub executions_completed: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_rejected: AtomicU64,
    pub steps_total: AtomicU64,
    pub steps_completed: AtomicU64,
    pub steps_failed: AtomicU64,
    pub retries_total: AtomicU64,
    pub llm_calls_total: AtomicU64,
    pub tokens_total: AtomicU64,
    pub total_execution_time_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retry as it is scheduled
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.executions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished run into the totals; retries are counted live
    pub fn record_execution(&self, result: &ExecutionResult) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        if result.is_success() {
            self.executions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }

        let m = &result.metrics;
        self.steps_total
            .fetch_add(m.step_count as u64, Ordering::Relaxed);
        self.steps_completed
            .fetch_add(m.completed_steps as u64, Ordering::Relaxed);
        self.steps_failed
            .fetch_add(m.failed_steps as u64, Ordering::Relaxed);
        self.llm_calls_total
            .fetch_add(m.llm_calls as u64, Ordering::Relaxed);
        self.tokens_total.fetch_add(m.total_tokens, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(m.total_duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        let executions_total = self.executions_total.load(Ordering::Relaxed);
        let total_execution_time_ms = self.total_execution_time_ms.load(Ordering::Relaxed);
        EngineMetricsSnapshot {
            executions_total,
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_rejected: self.executions_rejected.load(Ordering::Relaxed),
            steps_total: self.steps_total.load(Ordering::Relaxed),
            steps_completed: self.steps_completed.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            llm_calls_total: self.llm_calls_total.load(Ordering::Relaxed),
            tokens_total: self.tokens_total.load(Ordering::Relaxed),
            total_execution_time_ms,
            avg_execution_time_ms: if executions_total == 0 {
                0
            } else {
                total_execution_time_ms / executions_total
            },
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.executions_total,
            &self.executions_completed,
            &self.executions_failed,
            &self.executions_rejected,
            &self.steps_total,
            &self.steps_completed,
            &self.steps_failed,
            &self.retries_total,
            &self.llm_calls_total,
            &self.tokens_total,
            &self.total_execution_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetricsSnapshot {
    pub executions_total: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_rejected: u64,
    pub steps_total: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub retries_total: u64,
    pub llm_calls_total: u64,
    pub tokens_total: u64,
    pub total_execution_time_ms: u64,
    pub avg_execution_time_ms: u64,
}

impl EngineMetricsSnapshot {
    /// Share of finished executions that completed (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.executions_total == 0 {
            0.0
        } else {
            self.executions_completed as f64 / self.executions_total as f64
        }
    }
}
