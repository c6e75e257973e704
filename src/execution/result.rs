use super::trace::ExecutionTrace;
use crate::core::duration::millis;
use crate::core::errors::ConvoyError;
use crate::plan::ExecutionPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Structured failure of a single step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StepError {
    pub const TIMEOUT: &'static str = "TIMEOUT";
    pub const CIRCUIT_OPEN: &'static str = "CIRCUIT_OPEN";
    pub const ABORTED: &'static str = "ABORTED";
    pub const ACTION_NOT_FOUND: &'static str = "ACTION_NOT_FOUND";
    pub const STEP_FAILED: &'static str = "STEP_FAILED";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Self::STEP_FAILED, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            Self::TIMEOUT,
            format!("Step timed out after {}ms", after.as_millis()),
        )
    }

    pub fn circuit_open(target: &str) -> Self {
        Self::new(
            Self::CIRCUIT_OPEN,
            format!("Circuit breaker is open for target '{}'", target),
        )
    }

    pub fn aborted() -> Self {
        Self::new(Self::ABORTED, "Execution was cancelled")
    }

    pub fn action_not_found(target: &str) -> Self {
        Self::new(
            Self::ACTION_NOT_FOUND,
            format!("No action registered for target '{}'", target),
        )
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code == Self::TIMEOUT
    }

    pub fn is_aborted(&self) -> bool {
        self.code == Self::ABORTED
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == Self::CIRCUIT_OPEN
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StepError>() {
            Ok(step_error) => step_error,
            Err(err) => Self::failed(format!("{:#}", err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Terminal outcome of one step, produced once per step per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<StepError>,
    /// Invocation attempts made, including circuit-open rejections
    pub attempts: u32,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn completed(
        step_id: impl Into<String>,
        output: Value,
        attempts: u32,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
            duration,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        error: StepError,
        attempts: u32,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            duration,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Engine-level failure record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl From<&ConvoyError> for ExecutionError {
    fn from(err: &ConvoyError) -> Self {
        let step_id = match err {
            ConvoyError::Validation { step_id, .. } => step_id.clone(),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            step_id,
            timestamp: Utc::now(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// Per-run aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(rename = "total_duration_ms", with = "millis")]
    pub total_duration: Duration,
    pub step_count: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    /// Retries beyond each step's first attempt
    pub retry_count: u32,
    #[serde(rename = "average_step_duration_ms", with = "millis")]
    pub average_step_duration: Duration,
    pub llm_calls: usize,
    pub total_tokens: u64,
}

impl ExecutionMetrics {
    pub fn from_results(
        results: &[StepResult],
        trace: &ExecutionTrace,
        total_duration: Duration,
    ) -> Self {
        let completed_steps = results.iter().filter(|r| r.is_success()).count();
        let retry_count = results
            .iter()
            .map(|r| r.attempts.saturating_sub(1))
            .sum();
        let step_time: Duration = results.iter().map(|r| r.duration).sum();
        let average_step_duration = if results.is_empty() {
            Duration::ZERO
        } else {
            step_time / results.len() as u32
        };

        Self {
            total_duration,
            step_count: results.len(),
            completed_steps,
            failed_steps: results.len() - completed_steps,
            retry_count,
            average_step_duration,
            llm_calls: trace.llm_calls.len(),
            total_tokens: trace.total_tokens(),
        }
    }
}

/// Everything the caller gets back from one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub plan: ExecutionPlan,
    pub step_results: Vec<StepResult>,
    /// `null` with no successful step, the lone output with one, an array otherwise
    pub final_output: Value,
    pub metrics: ExecutionMetrics,
    pub errors: Vec<ExecutionError>,
    pub trace: ExecutionTrace,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}

/// Reduce successful outputs, in step-result order.
pub fn reduce_outputs(results: &[StepResult]) -> Value {
    let mut outputs: Vec<Value> = results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.output.clone())
        .collect();

    match outputs.len() {
        0 => Value::Null,
        1 => outputs.remove(0),
        _ => Value::Array(outputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ok(id: &str, output: Value) -> StepResult {
        StepResult::completed(id, output, 1, Utc::now(), Duration::from_millis(10))
    }

    fn failed(id: &str, attempts: u32) -> StepResult {
        StepResult::failed(
            id,
            StepError::failed("boom"),
            attempts,
            Utc::now(),
            Duration::from_millis(30),
        )
    }

    #[test]
    fn test_reduce_outputs() {
        assert_eq!(reduce_outputs(&[]), Value::Null);
        assert_eq!(reduce_outputs(&[failed("a", 1)]), Value::Null);
        assert_eq!(
            reduce_outputs(&[ok("a", json!(1)), failed("b", 1)]),
            json!(1)
        );
        assert_eq!(
            reduce_outputs(&[ok("a", json!(1)), ok("b", json!({"x": 2}))]),
            json!([1, {"x": 2}])
        );
    }

    #[test]
    fn test_metrics_from_results() {
        let results = vec![ok("a", json!(1)), failed("b", 3)];
        let metrics =
            ExecutionMetrics::from_results(&results, &ExecutionTrace::default(), Duration::from_secs(1));
        assert_eq!(metrics.step_count, 2);
        assert_eq!(metrics.completed_steps, 1);
        assert_eq!(metrics.failed_steps, 1);
        assert_eq!(metrics.retry_count, 2);
        assert_eq!(metrics.average_step_duration, Duration::from_millis(20));
    }

    #[test]
    fn test_step_error_from_anyhow() {
        let err: StepError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.code, StepError::STEP_FAILED);
        assert_eq!(err.message, "connection reset");

        let typed = anyhow::Error::new(StepError::new("RATE_LIMITED", "slow down"));
        let err: StepError = typed.into();
        assert_eq!(err.code, "RATE_LIMITED");
    }

    #[test]
    fn test_execution_error_from_convoy_error() {
        let err = ConvoyError::validation_step("Duplicate step id 'a'", "a");
        let record = ExecutionError::from(&err);
        assert_eq!(record.code, "VALIDATION_ERROR");
        assert_eq!(record.step_id.as_deref(), Some("a"));
        assert!(!record.recoverable);
    }
}
