//! Lifecycle observers.
//!
//! Every callback is optional. A failing or panicking observer is logged and
//! otherwise ignored; it never changes the outcome of a run.

use super::context::ExecutionContext;
use super::result::{ExecutionError, ExecutionResult, ExecutionStatus, StepResult, StepStatus};
use super::trace::{DecisionRecord, LlmCallRecord, Phase, PhaseRecord};
use crate::plan::{ExecutionPlan, ExecutionStep};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub trait ExecutionObserver: Send + Sync {
    fn on_execution_start(&self, _ctx: &ExecutionContext, _plan: &ExecutionPlan) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_execution_end(&self, _ctx: &ExecutionContext, _result: &ExecutionResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_phase_start(&self, _ctx: &ExecutionContext, _phase: Phase) -> anyhow::Result<()> {
        Ok(())
    }

    /// `record.error` carries the failure message when the phase failed
    fn on_phase_end(&self, _ctx: &ExecutionContext, _record: &PhaseRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_step_start(&self, _ctx: &ExecutionContext, _step: &ExecutionStep) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_step_end(
        &self,
        _ctx: &ExecutionContext,
        _step: &ExecutionStep,
        _result: &StepResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_decision(&self, _ctx: &ExecutionContext, _decision: &DecisionRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_llm_call(&self, _ctx: &ExecutionContext, _call: &LlmCallRecord) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&self, _ctx: &ExecutionContext, _error: &ExecutionError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans each callback out to a list of observers, isolating failures.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observers }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn notify<F>(&self, callback: &'static str, f: F)
    where
        F: Fn(&dyn ExecutionObserver) -> anyhow::Result<()>,
    {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(callback, error = %e, "Observer callback failed"),
                Err(_) => error!(callback, "Observer callback panicked"),
            }
        }
    }

    pub fn execution_start(&self, ctx: &ExecutionContext, plan: &ExecutionPlan) {
        self.notify("on_execution_start", |o| o.on_execution_start(ctx, plan));
    }

    pub fn execution_end(&self, ctx: &ExecutionContext, result: &ExecutionResult) {
        self.notify("on_execution_end", |o| o.on_execution_end(ctx, result));
    }

    pub fn phase_start(&self, ctx: &ExecutionContext, phase: Phase) {
        self.notify("on_phase_start", |o| o.on_phase_start(ctx, phase));
    }

    pub fn phase_end(&self, ctx: &ExecutionContext, record: &PhaseRecord) {
        self.notify("on_phase_end", |o| o.on_phase_end(ctx, record));
    }

    pub fn step_start(&self, ctx: &ExecutionContext, step: &ExecutionStep) {
        self.notify("on_step_start", |o| o.on_step_start(ctx, step));
    }

    pub fn step_end(&self, ctx: &ExecutionContext, step: &ExecutionStep, result: &StepResult) {
        self.notify("on_step_end", |o| o.on_step_end(ctx, step, result));
    }

    pub fn decision(&self, ctx: &ExecutionContext, decision: &DecisionRecord) {
        self.notify("on_decision", |o| o.on_decision(ctx, decision));
    }

    pub fn llm_call(&self, ctx: &ExecutionContext, call: &LlmCallRecord) {
        self.notify("on_llm_call", |o| o.on_llm_call(ctx, call));
    }

    pub fn error(&self, ctx: &ExecutionContext, err: &ExecutionError) {
        self.notify("on_error", |o| o.on_error(ctx, err));
    }
}

/// Mirrors lifecycle events into the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ExecutionObserver for LoggingObserver {
    fn on_execution_start(&self, ctx: &ExecutionContext, plan: &ExecutionPlan) -> anyhow::Result<()> {
        info!(
            execution_id = %ctx.execution_id,
            plan_id = %plan.id,
            steps = plan.steps.len(),
            "Execution started"
        );
        Ok(())
    }

    fn on_execution_end(&self, ctx: &ExecutionContext, result: &ExecutionResult) -> anyhow::Result<()> {
        info!(
            execution_id = %ctx.execution_id,
            status = ?result.status,
            duration_ms = result.metrics.total_duration.as_millis() as u64,
            "Execution finished"
        );
        Ok(())
    }

    fn on_phase_end(&self, ctx: &ExecutionContext, record: &PhaseRecord) -> anyhow::Result<()> {
        match &record.error {
            Some(err) => warn!(
                execution_id = %ctx.execution_id,
                phase = %record.phase,
                error = %err,
                "Phase failed"
            ),
            None => debug!(
                execution_id = %ctx.execution_id,
                phase = %record.phase,
                duration_ms = record.duration.as_millis() as u64,
                "Phase completed"
            ),
        }
        Ok(())
    }

    fn on_step_start(&self, ctx: &ExecutionContext, step: &ExecutionStep) -> anyhow::Result<()> {
        debug!(execution_id = %ctx.execution_id, step_id = %step.id, target = %step.target, "Step started");
        Ok(())
    }

    fn on_step_end(
        &self,
        ctx: &ExecutionContext,
        step: &ExecutionStep,
        result: &StepResult,
    ) -> anyhow::Result<()> {
        match &result.error {
            Some(err) => warn!(
                execution_id = %ctx.execution_id,
                step_id = %step.id,
                attempts = result.attempts,
                error = %err,
                "Step failed"
            ),
            None => info!(
                execution_id = %ctx.execution_id,
                step_id = %step.id,
                attempts = result.attempts,
                duration_ms = result.duration.as_millis() as u64,
                "Step completed"
            ),
        }
        Ok(())
    }

    fn on_error(&self, ctx: &ExecutionContext, err: &ExecutionError) -> anyhow::Result<()> {
        error!(execution_id = %ctx.execution_id, code = %err.code, "{}", err.message);
        Ok(())
    }
}

/// Flattened lifecycle event kept by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObserverEvent {
    ExecutionStarted { execution_id: String, plan_id: String },
    ExecutionFinished { execution_id: String, status: ExecutionStatus },
    PhaseStarted { phase: Phase },
    PhaseFinished { phase: Phase, duration: Duration, error: Option<String> },
    StepStarted { step_id: String },
    StepFinished { step_id: String, status: StepStatus, attempts: u32 },
    Decision { step_id: Option<String>, description: String },
    LlmCall { step_id: Option<String>, model: String, tokens: u64 },
    Error { code: String, message: String },
}

/// Buffers every callback as an [`ObserverEvent`]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: RwLock<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Ids of started steps, in start order
    pub fn started_steps(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::StepStarted { step_id } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ObserverEvent) -> anyhow::Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_execution_start(&self, ctx: &ExecutionContext, plan: &ExecutionPlan) -> anyhow::Result<()> {
        self.push(ObserverEvent::ExecutionStarted {
            execution_id: ctx.execution_id.clone(),
            plan_id: plan.id.clone(),
        })
    }

    fn on_execution_end(&self, ctx: &ExecutionContext, result: &ExecutionResult) -> anyhow::Result<()> {
        self.push(ObserverEvent::ExecutionFinished {
            execution_id: ctx.execution_id.clone(),
            status: result.status,
        })
    }

    fn on_phase_start(&self, _ctx: &ExecutionContext, phase: Phase) -> anyhow::Result<()> {
        self.push(ObserverEvent::PhaseStarted { phase })
    }

    fn on_phase_end(&self, _ctx: &ExecutionContext, record: &PhaseRecord) -> anyhow::Result<()> {
        self.push(ObserverEvent::PhaseFinished {
            phase: record.phase,
            duration: record.duration,
            error: record.error.clone(),
        })
    }

    fn on_step_start(&self, _ctx: &ExecutionContext, step: &ExecutionStep) -> anyhow::Result<()> {
        self.push(ObserverEvent::StepStarted {
            step_id: step.id.clone(),
        })
    }

    fn on_step_end(
        &self,
        _ctx: &ExecutionContext,
        step: &ExecutionStep,
        result: &StepResult,
    ) -> anyhow::Result<()> {
        self.push(ObserverEvent::StepFinished {
            step_id: step.id.clone(),
            status: result.status,
            attempts: result.attempts,
        })
    }

    fn on_decision(&self, _ctx: &ExecutionContext, decision: &DecisionRecord) -> anyhow::Result<()> {
        self.push(ObserverEvent::Decision {
            step_id: decision.step_id.clone(),
            description: decision.description.clone(),
        })
    }

    fn on_llm_call(&self, _ctx: &ExecutionContext, call: &LlmCallRecord) -> anyhow::Result<()> {
        self.push(ObserverEvent::LlmCall {
            step_id: call.step_id.clone(),
            model: call.model.clone(),
            tokens: call.total_tokens(),
        })
    }

    fn on_error(&self, _ctx: &ExecutionContext, err: &ExecutionError) -> anyhow::Result<()> {
        self.push(ObserverEvent::Error {
            code: err.code.clone(),
            message: err.message.clone(),
        })
    }
}
