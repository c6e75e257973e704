//! Per-target circuit breakers.
//!
//! Closed (calls flow), Open (calls rejected until `reset_timeout` has passed
//! since the last failure), HalfOpen (a limited number of probe calls; enough
//! consecutive successes close the circuit, any failure reopens it).

use crate::core::duration::millis;
use crate::core::errors::{ConvoyError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "reset_timeout_ms", with = "millis")]
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ConvoyError::configuration_field(
                "failure_threshold must be greater than 0",
                "circuit_breaker.failure_threshold",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConvoyError::configuration_field(
                "half_open_max_calls must be greater than 0",
                "circuit_breaker.half_open_max_calls",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_time: None,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let target = target.into();
        debug!(
            target_name = %target,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker created"
        );
        Self {
            target,
            config,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Whether a call may proceed now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// here, which is what lets the next call through.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(target_name = %self.target, "Circuit breaker transitioned to half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => inner.success_count < self.config.half_open_max_calls,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(target_name = %self.target, "Circuit breaker closed after successful probes");
                }
            }
            CircuitState::Open => {
                debug!(target_name = %self.target, "Success recorded while circuit is open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    target_name = %self.target,
                    failures = inner.failure_count,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(target_name = %self.target, "Probe failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    /// Force the breaker back to closed with cleared counters
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
        info!(target_name = %self.target, "Circuit breaker reset");
    }
}

/// Breakers keyed by step target, created on first use and never evicted.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `target`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps the config it was created with.
    pub fn get_or_create(&self, target: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return breaker.value().clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, config.clone())))
            .value()
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| b.value().clone())
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitBreakerState> {
        self.get(target).map(|b| b.snapshot())
    }

    /// Returns false when no breaker exists for `target`
    pub fn reset(&self, target: &str) -> bool {
        match self.get(target) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(reset_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout,
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("search", config(Duration::from_secs(60)));

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 3);
        assert!(snapshot.last_failure_time.is_some());
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let breaker = CircuitBreaker::new("search", config(Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("search", config(Duration::from_millis(20)));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("search", config(Duration::from_millis(20)));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_registry_keeps_first_config() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("llm", &config(Duration::from_secs(1)));
        let second = registry.get_or_create("llm", &CircuitBreakerConfig::default());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 3);
        assert_eq!(registry.targets(), vec!["llm".to_string()]);
    }

    #[test]
    fn test_registry_reset() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.get_or_create("llm", &config(Duration::from_secs(60)));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(registry.snapshot("llm").unwrap().state, CircuitState::Open);

        assert!(registry.reset("llm"));
        assert_eq!(registry.snapshot("llm").unwrap().state, CircuitState::Closed);
        assert!(!registry.reset("unknown"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
