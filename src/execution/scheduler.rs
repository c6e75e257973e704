use super::context::ExecutionContext;
use super::result::StepResult;
use super::trace::DecisionRecord;
use crate::core::errors::{ConvoyError, Result};
use crate::plan::graph::{ready_steps, stranded_steps};
use crate::plan::{ExecutionPlan, ExecutionStep, OnError};
use crate::resilience::{ResilienceContext, StepRunner};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs a plan's steps in dependency waves.
///
/// Every step in a wave is dispatched at once and the next wave starts only
/// after the whole wave has produced results. A wave has no size limit.
#[derive(Clone)]
pub struct DependencyScheduler {
    runner: StepRunner,
}

impl DependencyScheduler {
    pub fn new(runner: StepRunner) -> Self {
        Self { runner }
    }

    /// Run every step of `plan`, returning results in completion order.
    ///
    /// Stops after a wave in which a step with `on_error = fail` failed. A
    /// graph that stops making progress yields a circular dependency error.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        resilience: &ResilienceContext,
    ) -> Result<Vec<StepResult>> {
        let steps = &plan.steps;
        self.record_wave_policy(plan, ctx);

        let mut finished: HashSet<String> = HashSet::with_capacity(steps.len());
        let mut results = Vec::with_capacity(steps.len());
        let mut wave = 0usize;

        while finished.len() < steps.len() {
            let ready = ready_steps(steps, &finished);
            if ready.is_empty() {
                let stranded = stranded_steps(steps, &finished);
                warn!(
                    execution_id = %ctx.execution_id,
                    stranded = ?stranded,
                    "No runnable steps left, dependency cycle detected"
                );
                return Err(ConvoyError::circular_dependency(stranded));
            }

            debug!(
                execution_id = %ctx.execution_id,
                wave,
                size = ready.len(),
                "Dispatching wave"
            );

            let mut in_flight: FuturesUnordered<_> = ready
                .into_iter()
                .map(|step| self.run_observed(step, ctx, token, resilience))
                .collect();

            let mut stop = false;
            while let Some((step, result)) = in_flight.next().await {
                finished.insert(step.id.clone());
                if !result.is_success() && step.on_error == OnError::Fail {
                    stop = true;
                }
                results.push(result);
            }

            if stop {
                info!(
                    execution_id = %ctx.execution_id,
                    wave,
                    "Step failed with on_error=fail, not scheduling further waves"
                );
                break;
            }
            wave += 1;
        }

        Ok(results)
    }

    async fn run_observed<'a>(
        &self,
        step: &'a ExecutionStep,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        resilience: &ResilienceContext,
    ) -> (&'a ExecutionStep, StepResult) {
        ctx.observers().step_start(ctx, step);
        let result = self.runner.run_step(step, ctx, token, resilience).await;
        ctx.observers().step_end(ctx, step, &result);
        (step, result)
    }

    fn record_wave_policy(&self, plan: &ExecutionPlan, ctx: &ExecutionContext) {
        debug!(
            execution_id = %ctx.execution_id,
            strategy = plan.strategy.as_str(),
            "Plan strategy is advisory, running dependency waves"
        );
        ctx.record_decision(
            DecisionRecord::new(
                format!(
                    "Wave policy for plan '{}' (declared strategy: {})",
                    plan.id,
                    plan.strategy.as_str()
                ),
                json!("dependency_waves"),
            )
            .with_alternatives(vec![json!(plan.strategy.as_str())]),
        );
    }
}
