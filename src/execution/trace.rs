use crate::core::duration::millis;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    Execution,
    ResultProcessing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Execution => "execution",
            Self::ResultProcessing => "result_processing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    #[serde(default)]
    pub error: Option<String>,
}

/// A choice made while running a plan, kept for replay and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(default)]
    pub step_id: Option<String>,
    pub description: String,
    pub chosen: Value,
    #[serde(default)]
    pub alternatives: Vec<Value>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(description: impl Into<String>, chosen: Value) -> Self {
        Self {
            step_id: None,
            description: description.into(),
            chosen,
            alternatives: Vec::new(),
            confidence: 1.0,
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<Value>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub step_id: Option<String>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl LlmCallRecord {
    pub fn new(model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            step_id: None,
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Append-only record of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub phases: Vec<PhaseRecord>,
    pub decisions: Vec<DecisionRecord>,
    pub llm_calls: Vec<LlmCallRecord>,
}

impl ExecutionTrace {
    pub fn total_tokens(&self) -> u64 {
        self.llm_calls
            .iter()
            .fold(0u64, |acc, call| acc.saturating_add(call.total_tokens()))
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Shared, lock-guarded trace for a run in progress.
///
/// With tracing disabled nothing is kept, except LLM calls which still feed
/// the run's token metrics.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    enabled: bool,
    trace: Mutex<ExecutionTrace>,
}

impl TraceRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            trace: Mutex::new(ExecutionTrace::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_phase(&self, record: PhaseRecord) {
        if self.enabled {
            self.trace.lock().phases.push(record);
        }
    }

    pub fn record_decision(&self, record: DecisionRecord) {
        if self.enabled {
            self.trace.lock().decisions.push(record);
        }
    }

    pub fn record_llm_call(&self, record: LlmCallRecord) {
        self.trace.lock().llm_calls.push(record);
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> ExecutionTrace {
        self.trace.lock().clone()
    }

    /// The trace handed back to the caller
    pub fn finish(&self) -> ExecutionTrace {
        let trace = self.snapshot();
        if self.enabled {
            trace
        } else {
            ExecutionTrace::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phase(phase: Phase) -> PhaseRecord {
        PhaseRecord {
            phase,
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
            error: None,
        }
    }

    #[test]
    fn test_recorder_appends_in_order() {
        let recorder = TraceRecorder::new(true);
        recorder.record_phase(phase(Phase::Initialization));
        recorder.record_phase(phase(Phase::Execution));
        recorder.record_decision(DecisionRecord::new("wave policy", json!("parallel")));
        recorder.record_llm_call(LlmCallRecord::new("gpt", 100, 20).for_step("a"));
        recorder.record_llm_call(LlmCallRecord::new("gpt", 50, 5));

        let trace = recorder.finish();
        let phases: Vec<Phase> = trace.phases.iter().map(|p| p.phase).collect();
        assert_eq!(phases, vec![Phase::Initialization, Phase::Execution]);
        assert_eq!(trace.decisions.len(), 1);
        assert_eq!(trace.total_tokens(), 175);
    }

    #[test]
    fn test_disabled_recorder_returns_empty_trace() {
        let recorder = TraceRecorder::new(false);
        recorder.record_phase(phase(Phase::Execution));
        recorder.record_llm_call(LlmCallRecord::new("gpt", 10, 10));

        assert_eq!(recorder.snapshot().llm_calls.len(), 1);
        assert_eq!(recorder.finish(), ExecutionTrace::default());
    }

    #[test]
    fn test_confidence_clamped() {
        let record = DecisionRecord::new("pick", json!(1)).with_confidence(1.7);
        assert_eq!(record.confidence, 1.0);
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let value = serde_json::to_value(phase(Phase::ResultProcessing)).unwrap();
        assert_eq!(value["phase"], json!("result_processing"));
        assert_eq!(value["duration_ms"], json!(5));
    }
}
