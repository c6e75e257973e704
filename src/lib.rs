//! Dependency-aware, resilient execution of multi-step plans.
//!
//! A plan is a set of steps with declared dependencies. The
//! [`ExecutionEngine`] runs it in waves of mutually independent steps, each
//! step going through timeout, retry with backoff and a per-target circuit
//! breaker before its result is recorded.

// Core infrastructure modules
pub mod core;

pub mod action;
pub mod execution;
pub mod plan;
pub mod resilience;

// Re-exports for convenience
pub use crate::core::errors::{ConvoyError, Result};
pub use crate::core::logging::{init_from_env, init_logging};
pub use action::{ActionRegistry, EchoAction, FnAction, StepAction, StepInvoker};
pub use execution::{
    ContextOverrides, EngineConfig, ExecutionContext, ExecutionEngine, ExecutionObserver,
    ExecutionResult, ExecutionStatus, MetricsCollector, StepError, StepResult, StepStatus,
};
pub use plan::{ExecutionPlan, ExecutionStep, ExecutionStrategy, OnError, PlanBuilder, StepKind};
pub use resilience::{
    BackoffStrategy, CircuitBreakerConfig, CircuitState, ResilienceContext, RetryPolicy,
};
