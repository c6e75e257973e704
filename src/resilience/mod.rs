//! Retry, backoff, circuit breaking and the per-step runner that combines them.

pub mod backoff;
pub mod circuit_breaker;
pub mod policy;
pub mod runner;

pub use backoff::calculate_delay;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
pub use policy::{BackoffStrategy, ResilienceContext, RetryCallback, RetryPolicy, RetryPolicyBuilder};
pub use runner::StepRunner;
