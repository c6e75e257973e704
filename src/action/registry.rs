use super::{StepAction, StepInvoker};
use crate::execution::{ExecutionContext, StepError};
use crate::plan::{ExecutionStep, StepKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry for step actions, keyed by target with a per-kind fallback.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn StepAction>>>>,
    kind_defaults: Arc<RwLock<HashMap<StepKind, Arc<dyn StepAction>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own name
    pub fn register(&self, action: Arc<dyn StepAction>) {
        let name = action.name().to_string();
        self.actions.write().insert(name, action);
    }

    /// Register an action under an explicit target name
    pub fn register_as(&self, target: impl Into<String>, action: Arc<dyn StepAction>) {
        self.actions.write().insert(target.into(), action);
    }

    /// Action used for steps of `kind` whose target has no registration
    pub fn register_kind_default(&self, kind: StepKind, action: Arc<dyn StepAction>) {
        self.kind_defaults.write().insert(kind, action);
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.read().get(target).cloned()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.actions.read().contains_key(target)
    }

    /// List all registered target names
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Find the action a step would run
    pub fn resolve(&self, step: &ExecutionStep) -> Option<Arc<dyn StepAction>> {
        self.get(&step.target)
            .or_else(|| self.kind_defaults.read().get(&step.kind).cloned())
    }
}

#[async_trait]
impl StepInvoker for ActionRegistry {
    async fn invoke(&self, step: &ExecutionStep, ctx: &ExecutionContext) -> Result<Value, StepError> {
        let action = self
            .resolve(step)
            .ok_or_else(|| StepError::action_not_found(&step.target))?;

        action.validate_parameters(&step.parameters)?;

        debug!(step_id = %step.id, action = action.name(), "Invoking action");
        Ok(action.execute(step, ctx).await?)
    }
}
