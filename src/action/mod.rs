//! The seam between the orchestrator and the code that actually does the work.
//!
//! The engine only needs a [`StepInvoker`]. [`ActionRegistry`] is the stock
//! invoker: it maps step targets (or, failing that, step kinds) to
//! [`StepAction`] implementations.

pub mod function;
pub mod registry;

pub use function::{EchoAction, FnAction};
pub use registry::ActionRegistry;

use crate::execution::{ExecutionContext, StepError};
use crate::plan::ExecutionStep;
use async_trait::async_trait;
use serde_json::Value;

/// Invokes a step's underlying action once.
///
/// Retries, timeouts and circuit breaking are applied around this call.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, step: &ExecutionStep, ctx: &ExecutionContext) -> Result<Value, StepError>;
}

/// A named unit of business logic a step can target.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Name used as the registry key, normally the step `target`
    fn name(&self) -> &str;

    async fn execute(&self, step: &ExecutionStep, ctx: &ExecutionContext) -> anyhow::Result<Value>;

    /// Optional: reject parameters before the action runs
    fn validate_parameters(&self, _parameters: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}
