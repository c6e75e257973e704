use crate::core::duration::millis;
use crate::core::errors::{ConvoyError, Result};
use crate::resilience::{CircuitBreakerConfig, ResilienceContext, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Step timeout when neither the step nor the resilience context sets one
    #[serde(rename = "default_timeout_ms", with = "millis")]
    pub default_timeout: Duration,
    /// Retry policy used when `execute` is called without a resilience context
    pub default_retry_policy: RetryPolicy,
    /// Circuit breaker used when `execute` is called without a resilience context
    pub default_circuit_breaker: Option<CircuitBreakerConfig>,
    /// Keep phase, decision and LLM call records in the returned trace
    pub enable_tracing: bool,
    /// Report to the installed metrics collector
    pub enable_metrics: bool,
    /// Admission limit on whole-plan executions in flight
    pub max_concurrent_executions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            default_retry_policy: RetryPolicy::default(),
            default_circuit_breaker: None,
            enable_tracing: true,
            enable_metrics: true,
            max_concurrent_executions: 10,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(ConvoyError::configuration_field(
                "default_timeout must be greater than 0",
                "default_timeout_ms",
            ));
        }

        if self.max_concurrent_executions == 0 {
            return Err(ConvoyError::configuration_field(
                "max_concurrent_executions must be greater than 0",
                "max_concurrent_executions",
            ));
        }

        let policy = &self.default_retry_policy;
        if policy.base_delay > policy.max_delay {
            return Err(ConvoyError::configuration_field(
                "base_delay cannot be greater than max_delay",
                "default_retry_policy.base_delay_ms",
            ));
        }

        if let Some(breaker) = &self.default_circuit_breaker {
            breaker.validate()?;
        }

        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    /// Resilience context applied when the caller supplies none
    pub fn default_resilience(&self) -> ResilienceContext {
        ResilienceContext {
            retry_policy: self.default_retry_policy.clone(),
            circuit_breaker: self.default_circuit_breaker.clone(),
            timeout: None,
        }
    }

    /// Preset for tests and local runs: short timeout, fast retries
    pub fn development() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            default_retry_policy: RetryPolicy::builder(|p| {
                p.max_retries(1)
                    .base_delay(Duration::from_millis(10))
                    .max_delay(Duration::from_millis(100))
            }),
            ..Self::default()
        }
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.default_retry_policy = policy;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.default_circuit_breaker = Some(config);
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.config.enable_tracing = enabled;
        self
    }

    pub fn metrics(mut self, enabled: bool) -> Self {
        self.config.enable_metrics = enabled;
        self
    }

    pub fn max_concurrent_executions(mut self, max: usize) -> Self {
        self.config.max_concurrent_executions = max;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
