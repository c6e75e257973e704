use super::backoff::calculate_delay;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use super::policy::ResilienceContext;
use crate::action::StepInvoker;
use crate::core::errors::panic_message;
use crate::execution::metrics::{EngineMetrics, MetricsCollector, STEP_RETRIES_TOTAL};
use crate::execution::{ExecutionContext, StepError, StepResult};
use crate::plan::{ExecutionStep, OnError};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Runs one step through timeout, circuit breaker and retry handling.
#[derive(Clone)]
pub struct StepRunner {
    invoker: Arc<dyn StepInvoker>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<EngineMetrics>,
    collector: Option<Arc<dyn MetricsCollector>>,
    default_timeout: Duration,
}

impl StepRunner {
    pub fn new(
        invoker: Arc<dyn StepInvoker>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<EngineMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            invoker,
            breakers,
            metrics,
            collector: None,
            default_timeout,
        }
    }

    pub fn with_collector(mut self, collector: Option<Arc<dyn MetricsCollector>>) -> Self {
        self.collector = collector;
        self
    }

    /// Run `step` to a terminal result. Never fails; every error ends up in
    /// the returned [`StepResult`].
    #[instrument(
        name = "run_step",
        skip_all,
        fields(execution_id = %ctx.execution_id, step_id = %step.id, target = %step.target)
    )]
    pub async fn run_step(
        &self,
        step: &ExecutionStep,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        resilience: &ResilienceContext,
    ) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let policy = &resilience.retry_policy;
        let max_retries = step.retries.unwrap_or(policy.max_retries);
        let timeout = step
            .timeout
            .or(resilience.timeout)
            .unwrap_or(self.default_timeout);
        let breaker = resilience
            .circuit_breaker
            .as_ref()
            .map(|config| self.breakers.get_or_create(&step.target, config));

        let mut attempts = 0u32;
        let mut last_error = StepError::aborted();

        for attempt in 0..=max_retries {
            if token.is_cancelled() {
                debug!(attempt, "Cancellation observed, aborting step");
                last_error = StepError::aborted();
                break;
            }
            attempts += 1;

            match self.attempt(step, ctx, timeout, breaker.as_deref()).await {
                Ok(output) => {
                    debug!(attempt, "Step attempt succeeded");
                    return StepResult::completed(
                        step.id.clone(),
                        output,
                        attempts,
                        started_at,
                        start.elapsed(),
                    );
                }
                Err(err) => {
                    if !policy.is_retryable(&err) || attempt == max_retries {
                        warn!(attempt, code = %err.code, error = %err.message, "Step attempt failed, not retrying");
                        last_error = err;
                        break;
                    }

                    let delay = calculate_delay(attempt, policy);
                    warn!(
                        attempt,
                        code = %err.code,
                        delay_ms = delay.as_millis() as u64,
                        "Step attempt failed, retrying"
                    );
                    if let Some(on_retry) = &policy.on_retry {
                        on_retry(attempt, &err, delay);
                    }
                    self.metrics.record_retry();
                    if let Some(collector) = &self.collector {
                        collector.increment(STEP_RETRIES_TOTAL, 1, &[("target", step.target.as_str())]);
                    }
                    last_error = err;

                    // Cancellation cuts the sleep short; the loop top turns it into ABORTED
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {}
                    }
                }
            }
        }

        let mut result = StepResult::failed(
            step.id.clone(),
            last_error,
            attempts,
            started_at,
            start.elapsed(),
        );
        if step.on_error == OnError::Fallback {
            result.output = step.fallback.clone();
        }
        result
    }

    async fn attempt(
        &self,
        step: &ExecutionStep,
        ctx: &ExecutionContext,
        timeout: Duration,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<Value, StepError> {
        if let Some(breaker) = breaker {
            if !breaker.can_execute() {
                return Err(StepError::circuit_open(&step.target));
            }
        }

        let invocation = AssertUnwindSafe(self.invoker.invoke(step, ctx)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message("action panicked", panic.as_ref());
                warn!(error = %message, "Step action panicked");
                Err(StepError::failed(message))
            }
            Err(_) => Err(StepError::timeout(timeout)),
        };

        if let Some(breaker) = breaker {
            match &outcome {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionRegistry, FnAction, StepAction};
    use crate::execution::{ContextOverrides, StepStatus};
    use crate::plan::StepKind;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner_with(registry: ActionRegistry) -> (StepRunner, Arc<CircuitBreakerRegistry>, Arc<EngineMetrics>) {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let metrics = Arc::new(EngineMetrics::new());
        let runner = StepRunner::new(
            Arc::new(registry),
            breakers.clone(),
            metrics.clone(),
            Duration::from_secs(5),
        );
        (runner, breakers, metrics)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("exec", ContextOverrides::default())
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder(|p| {
            p.max_retries(max_retries)
                .fixed_backoff()
                .base_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .retry_on(["NETWORK_ERROR"])
        })
    }

    struct FailingAction {
        name: String,
        code: &'static str,
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl StepAction for FailingAction {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _step: &ExecutionStep, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StepError::new(self.code, "nope").into())
        }
    }

    fn counting_action(name: &str, code: &'static str, calls: Arc<AtomicU32>) -> Arc<FailingAction> {
        Arc::new(FailingAction {
            name: name.to_string(),
            code,
            calls,
        })
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(FnAction::new("ok", |_s, _c| async move { Ok(json!("done")) })));
        let (runner, _, _) = runner_with(registry);

        let step = ExecutionStep::new("a", StepKind::Tool, "ok");
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::default())
            .await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.output, Some(json!("done")));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_counts() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("flaky", "NETWORK_ERROR", calls.clone()));
        let (runner, _, metrics) = runner_with(registry);

        let callbacks = Arc::new(AtomicU32::new(0));
        let seen = callbacks.clone();
        let policy = RetryPolicy::builder(|p| {
            p.max_retries(3)
                .fixed_backoff()
                .base_delay(Duration::from_millis(1))
                .retry_on(["NETWORK_ERROR"])
                .on_retry(move |_, _, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
        });

        let step = ExecutionStep::new("a", StepKind::Tool, "flaky");
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::new(policy))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(callbacks.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts, 4);
        assert_eq!(metrics.snapshot().retries_total, 3);
        assert_eq!(result.error.unwrap().code, "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn test_step_retries_override_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("flaky", "NETWORK_ERROR", calls.clone()));
        let (runner, _, _) = runner_with(registry);

        let step = ExecutionStep::new("a", StepKind::Tool, "flaky").with_retries(1);
        runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::new(fast_policy(5)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("broken", "INVALID_INPUT", calls.clone()));
        let (runner, _, _) = runner_with(registry);

        let step = ExecutionStep::new("a", StepKind::Tool, "broken");
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::new(fast_policy(3)))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_step() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(FnAction::new("slow", |_s, _c| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("late"))
        })));
        let (runner, _, _) = runner_with(registry);

        let step = ExecutionStep::new("a", StepKind::Tool, "slow").with_timeout(Duration::from_millis(50));
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::new(RetryPolicy::none()))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.unwrap().code, StepError::TIMEOUT);
        assert!(result.duration < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("flaky", "NETWORK_ERROR", calls.clone()));
        let (runner, _, _) = runner_with(registry);

        let token = CancellationToken::new();
        token.cancel();
        let step = ExecutionStep::new("a", StepKind::Tool, "flaky");
        let result = runner
            .run_step(&step, &ctx(), &token, &ResilienceContext::new(fast_policy(3)))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.error.unwrap().code, StepError::ABORTED);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("down", "SERVICE_DOWN", calls.clone()));
        let (runner, breakers, _) = runner_with(registry);

        let resilience = ResilienceContext::new(RetryPolicy::none()).with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        });
        let step = ExecutionStep::new("a", StepKind::Tool, "down");
        let token = CancellationToken::new();

        runner.run_step(&step, &ctx(), &token, &resilience).await;
        runner.run_step(&step, &ctx(), &token, &resilience).await;
        assert_eq!(breakers.snapshot("down").unwrap().state, CircuitState::Open);

        let result = runner.run_step(&step, &ctx(), &token, &resilience).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.error.unwrap().code, StepError::CIRCUIT_OPEN);
        assert_eq!(breakers.snapshot("down").unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn test_fallback_output_recorded() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ActionRegistry::new();
        registry.register(counting_action("broken", "INVALID_INPUT", calls));
        let (runner, _, _) = runner_with(registry);

        let step = ExecutionStep::new("a", StepKind::Tool, "broken")
            .with_on_error(OnError::Fallback)
            .with_fallback(json!("cached answer"));
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &ResilienceContext::new(RetryPolicy::none()))
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.output, Some(json!("cached answer")));
    }

    #[tokio::test]
    async fn test_panicking_action_fails_step_and_trips_breaker() {
        struct Panicking;

        #[async_trait::async_trait]
        impl StepAction for Panicking {
            fn name(&self) -> &str {
                "panicky"
            }

            async fn execute(&self, _step: &ExecutionStep, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
                panic!("action blew up")
            }
        }

        let registry = ActionRegistry::new();
        registry.register(Arc::new(Panicking));
        let (runner, breakers, _) = runner_with(registry);

        let resilience = ResilienceContext::new(RetryPolicy::none()).with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        });
        let step = ExecutionStep::new("a", StepKind::Tool, "panicky");
        let result = runner
            .run_step(&step, &ctx(), &CancellationToken::new(), &resilience)
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        let error = result.error.unwrap();
        assert_eq!(error.code, StepError::STEP_FAILED);
        assert_eq!(error.message, "action panicked: action blew up");
        assert_eq!(breakers.snapshot("panicky").unwrap().state, CircuitState::Open);
    }
}
