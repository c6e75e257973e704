use super::circuit_breaker::CircuitBreakerConfig;
use crate::core::duration::{millis, option_millis};
use crate::execution::StepError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called before each retry sleep with `(attempt, error, delay)`
pub type RetryCallback = Arc<dyn Fn(u32, &StepError, Duration) + Send + Sync>;

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * (attempt + 1)`
    Linear,
    /// `base_delay * 2^attempt`
    #[default]
    Exponential,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Error codes worth retrying; timeouts are always retried
    pub retryable_errors: Vec<String>,
    #[serde(skip)]
    pub on_retry: Option<RetryCallback>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("retryable_errors", &self.retryable_errors)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retryable_errors: vec![
                "TIMEOUT".to_string(),
                "NETWORK_ERROR".to_string(),
                "RATE_LIMITED".to_string(),
                "SERVICE_UNAVAILABLE".to_string(),
            ],
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Start from the defaults and adjust through a [`RetryPolicyBuilder`]
    pub fn builder<F>(configure: F) -> Self
    where
        F: FnOnce(RetryPolicyBuilder) -> RetryPolicyBuilder,
    {
        configure(RetryPolicyBuilder::new(Self::default())).build()
    }

    /// Whether a failed attempt with this error may be retried.
    ///
    /// `ABORTED` never is; `TIMEOUT`, or any message mentioning a timeout,
    /// always is.
    pub fn is_retryable(&self, error: &StepError) -> bool {
        if error.is_aborted() {
            return false;
        }
        if error.is_timeout() || self.retryable_errors.iter().any(|c| c == &error.code) {
            return true;
        }
        let message = error.message.to_lowercase();
        message.contains("timeout") || message.contains("timed out")
    }
}

/// Builder for retry policies
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.backoff = strategy;
        self
    }

    pub fn fixed_backoff(self) -> Self {
        self.backoff(BackoffStrategy::Fixed)
    }

    pub fn linear_backoff(self) -> Self {
        self.backoff(BackoffStrategy::Linear)
    }

    pub fn exponential_backoff(self) -> Self {
        self.backoff(BackoffStrategy::Exponential)
    }

    /// Replace the retryable error codes
    pub fn retry_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy.retryable_errors = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &StepError, Duration) + Send + Sync + 'static,
    {
        self.policy.on_retry = Some(Arc::new(callback));
        self
    }

    fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Policy bundle applied to one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceContext {
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Used when a step declares no timeout of its own
    #[serde(default, rename = "timeout_ms", with = "option_millis")]
    pub timeout: Option<Duration>,
}

impl ResilienceContext {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            circuit_breaker: None,
            timeout: None,
        }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
