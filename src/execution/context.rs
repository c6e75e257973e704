use super::observer::CompositeObserver;
use super::trace::{DecisionRecord, ExecutionTrace, LlmCallRecord, TraceRecorder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Caller-supplied seed for a run's [`ExecutionContext`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOverrides {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ContextOverrides {
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_parent_execution_id(mut self, parent: impl Into<String>) -> Self {
        self.parent_execution_id = Some(parent.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-run identity passed to every step invocation.
///
/// Actions may record decisions and LLM calls through it; those land in the
/// run's trace and are forwarded to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub session_id: String,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(skip)]
    recorder: Arc<TraceRecorder>,
    #[serde(skip)]
    observers: CompositeObserver,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, overrides: ContextOverrides) -> Self {
        Self {
            execution_id: execution_id.into(),
            session_id: overrides
                .session_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            parent_execution_id: overrides.parent_execution_id,
            created_at: Utc::now(),
            metadata: overrides.metadata,
            recorder: Arc::new(TraceRecorder::new(true)),
            observers: CompositeObserver::default(),
        }
    }

    pub(crate) fn with_recorder(mut self, recorder: Arc<TraceRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub(crate) fn with_observers(mut self, observers: CompositeObserver) -> Self {
        self.observers = observers;
        self
    }

    pub(crate) fn observers(&self) -> &CompositeObserver {
        &self.observers
    }

    pub(crate) fn recorder(&self) -> &TraceRecorder {
        &self.recorder
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn record_decision(&self, decision: DecisionRecord) {
        self.observers.decision(self, &decision);
        self.recorder.record_decision(decision);
    }

    pub fn record_llm_call(&self, call: LlmCallRecord) {
        self.observers.llm_call(self, &call);
        self.recorder.record_llm_call(call);
    }

    /// Trace recorded so far in this run
    pub fn trace_snapshot(&self) -> ExecutionTrace {
        self.recorder.snapshot()
    }
}
