use super::StepAction;
use crate::execution::ExecutionContext;
use crate::plan::ExecutionStep;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use tracing::info;

/// Adapts an async closure into a [`StepAction`].
///
/// The closure receives owned copies of the step and context so the returned
/// future can be `'static`.
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(ExecutionStep, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(ExecutionStep, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, step: &ExecutionStep, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        (self.f)(step.clone(), ctx.clone()).await
    }
}

/// Returns the step's parameters unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAction;

#[async_trait]
impl StepAction for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, step: &ExecutionStep, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
        info!(step_id = %step.id, "Echo action with parameters: {}", step.parameters);
        Ok(step.parameters.clone())
    }
}
