use super::config::EngineConfig;
use super::context::{ContextOverrides, ExecutionContext};
use super::metrics::{
    EngineMetrics, EngineMetricsSnapshot, MetricsCollector, ACTIVE_EXECUTIONS,
    EXECUTIONS_TOTAL, EXECUTION_DURATION_MS, STEPS_TOTAL,
};
use super::observer::{CompositeObserver, ExecutionObserver};
use super::result::{
    reduce_outputs, ExecutionError, ExecutionMetrics, ExecutionResult, ExecutionStatus,
    StepResult,
};
use super::scheduler::DependencyScheduler;
use super::trace::{Phase, PhaseRecord, TraceRecorder};
use crate::action::StepInvoker;
use crate::core::errors::{panic_message, ConvoyError, Result};
use crate::core::limits::{AdmissionController, AdmissionStats};
use crate::plan::ExecutionPlan;
use crate::resilience::{CircuitBreakerRegistry, CircuitBreakerState, ResilienceContext, StepRunner};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Runs plans with admission control, cancellation and per-target circuit
/// breakers shared across every execution it hosts.
pub struct ExecutionEngine {
    config: EngineConfig,
    invoker: Arc<dyn StepInvoker>,
    admission: AdmissionController,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<EngineMetrics>,
    collector: RwLock<Option<Arc<dyn MetricsCollector>>>,
    observers: RwLock<Vec<Arc<dyn ExecutionObserver>>>,
    active: DashMap<String, CancellationToken>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, invoker: Arc<dyn StepInvoker>) -> Result<Self> {
        config.validate()?;
        let admission = AdmissionController::new(config.max_concurrent_executions)?;

        info!(
            max_concurrent_executions = config.max_concurrent_executions,
            default_timeout_ms = config.default_timeout.as_millis() as u64,
            "Execution engine created"
        );

        Ok(Self {
            config,
            invoker,
            admission,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            metrics: Arc::new(EngineMetrics::new()),
            collector: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            active: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn set_metrics_collector(&self, collector: Arc<dyn MetricsCollector>) {
        *self.collector.write() = Some(collector);
    }

    /// Run `plan` to completion.
    ///
    /// Only an admission rejection is returned as `Err`. Validation failures,
    /// dependency cycles and internal faults come back as a failed
    /// [`ExecutionResult`] carrying a single engine-level error.
    #[instrument(name = "execute", skip_all, fields(plan_id = %plan.id))]
    pub async fn execute(
        &self,
        plan: ExecutionPlan,
        overrides: ContextOverrides,
        resilience: Option<ResilienceContext>,
    ) -> Result<ExecutionResult> {
        let _slot = self.admission.try_admit().map_err(|e| {
            self.metrics.record_rejection();
            e
        })?;

        let execution_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let _registration = ActiveRegistration::new(&self.active, &execution_id, token.clone());

        let resilience = resilience.unwrap_or_else(|| self.config.default_resilience());
        let recorder = Arc::new(TraceRecorder::new(self.config.enable_tracing));
        let observers = CompositeObserver::new(self.observers.read().clone());
        let ctx = ExecutionContext::new(execution_id.clone(), overrides)
            .with_recorder(recorder.clone())
            .with_observers(observers);
        let collector = self.active_collector();

        if let Some(collector) = &collector {
            collector.gauge(ACTIVE_EXECUTIONS, self.admission.in_flight() as f64, &[]);
        }

        info!(
            execution_id = %execution_id,
            steps = plan.steps.len(),
            strategy = plan.strategy.as_str(),
            "Starting execution"
        );
        ctx.observers().execution_start(&ctx, &plan);

        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.run_phases(&plan, &ctx, &token, &resilience, &collector))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ConvoyError::internal(panic_message("execution panicked", panic.as_ref()))
                    .with_context("execution_id", execution_id.clone()))
            });
        let total_duration = start.elapsed();

        let result = match outcome {
            Ok((step_results, final_output)) => {
                let status = if step_results.iter().all(StepResult::is_success) {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                let metrics =
                    ExecutionMetrics::from_results(&step_results, &recorder.snapshot(), total_duration);
                ExecutionResult {
                    execution_id: execution_id.clone(),
                    status,
                    plan,
                    step_results,
                    final_output,
                    metrics,
                    errors: Vec::new(),
                    trace: recorder.finish(),
                }
            }
            Err(err) => {
                error!(
                    execution_id = %execution_id,
                    code = err.code(),
                    error = %err,
                    "Execution failed"
                );
                let record = ExecutionError::from(&err);
                ctx.observers().error(&ctx, &record);
                ExecutionResult {
                    execution_id: execution_id.clone(),
                    status: ExecutionStatus::Failed,
                    plan,
                    step_results: Vec::new(),
                    final_output: Value::Null,
                    metrics: ExecutionMetrics::from_results(&[], &recorder.snapshot(), total_duration),
                    errors: vec![record],
                    trace: recorder.finish(),
                }
            }
        };

        self.metrics.record_execution(&result);
        if let Some(collector) = &collector {
            report_execution(collector.as_ref(), &result, self.admission.in_flight());
        }

        info!(
            execution_id = %execution_id,
            status = ?result.status,
            steps = result.step_results.len(),
            duration_ms = total_duration.as_millis() as u64,
            "Execution finished"
        );
        ctx.observers().execution_end(&ctx, &result);

        Ok(result)
    }

    async fn run_phases(
        &self,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        resilience: &ResilienceContext,
        collector: &Option<Arc<dyn MetricsCollector>>,
    ) -> Result<(Vec<StepResult>, Value)> {
        traced_phase(ctx, Phase::Initialization, async { plan.validate() }).await?;

        let runner = StepRunner::new(
            self.invoker.clone(),
            self.breakers.clone(),
            self.metrics.clone(),
            self.config.default_timeout,
        )
        .with_collector(collector.clone());
        let scheduler = DependencyScheduler::new(runner);
        let step_results = traced_phase(
            ctx,
            Phase::Execution,
            scheduler.run(plan, ctx, token, resilience),
        )
        .await?;

        let final_output = traced_phase(ctx, Phase::ResultProcessing, async {
            Ok(reduce_outputs(&step_results))
        })
        .await?;

        Ok((step_results, final_output))
    }

    /// Revoke the cancellation token of a running execution.
    ///
    /// Steps observe it at their next attempt; an in-flight invocation is not
    /// interrupted. Returns false for unknown or finished executions.
    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        match self.active.get(execution_id) {
            Some(token) => {
                token.cancel();
                info!(execution_id, "Execution cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of executions currently running
    pub fn active_executions(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    pub fn get_metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
        debug!("Engine metrics reset");
    }

    pub fn circuit_breaker_state(&self, target: &str) -> Option<CircuitBreakerState> {
        self.breakers.snapshot(target)
    }

    pub fn reset_circuit_breaker(&self, target: &str) -> bool {
        self.breakers.reset(target)
    }

    fn active_collector(&self) -> Option<Arc<dyn MetricsCollector>> {
        if self.config.enable_metrics {
            self.collector.read().clone()
        } else {
            None
        }
    }
}

/// Run one phase, recording its timing and outcome in the trace and
/// notifying observers.
async fn traced_phase<T, F>(ctx: &ExecutionContext, phase: Phase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started_at = Utc::now();
    let start = Instant::now();
    ctx.observers().phase_start(ctx, phase);

    let outcome = fut.await;

    let record = PhaseRecord {
        phase,
        started_at,
        duration: start.elapsed(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    };
    debug!(
        execution_id = %ctx.execution_id,
        phase = %phase,
        duration_ms = record.duration.as_millis() as u64,
        failed = record.error.is_some(),
        "Phase finished"
    );
    ctx.observers().phase_end(ctx, &record);
    ctx.recorder().record_phase(record);
    outcome
}

fn report_execution(collector: &dyn MetricsCollector, result: &ExecutionResult, in_flight: usize) {
    let status = match result.status {
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    };
    let m = &result.metrics;

    collector.increment(EXECUTIONS_TOTAL, 1, &[("status", status)]);
    collector.histogram(
        EXECUTION_DURATION_MS,
        m.total_duration.as_secs_f64() * 1000.0,
        &[("status", status)],
    );
    collector.timing(EXECUTION_DURATION_MS, m.total_duration, &[("status", status)]);
    collector.increment(STEPS_TOTAL, m.completed_steps as u64, &[("status", "completed")]);
    collector.increment(STEPS_TOTAL, m.failed_steps as u64, &[("status", "failed")]);
    // The finishing execution still holds its slot here
    collector.gauge(ACTIVE_EXECUTIONS, in_flight.saturating_sub(1) as f64, &[]);
}

/// Keeps an execution's cancellation token reachable while it runs
struct ActiveRegistration<'a> {
    active: &'a DashMap<String, CancellationToken>,
    execution_id: String,
}

impl<'a> ActiveRegistration<'a> {
    fn new(
        active: &'a DashMap<String, CancellationToken>,
        execution_id: &str,
        token: CancellationToken,
    ) -> Self {
        active.insert(execution_id.to_string(), token);
        Self {
            active,
            execution_id: execution_id.to_string(),
        }
    }
}

impl Drop for ActiveRegistration<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.execution_id);
    }
}
