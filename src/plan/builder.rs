use super::types::{ExecutionPlan, ExecutionStep, ExecutionStrategy, OnError, StepKind};
use crate::core::errors::{ConvoyError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Fluent builder for [`ExecutionPlan`]s.
///
/// ```
/// use convoy::plan::{PlanBuilder, StepKind};
///
/// let plan = PlanBuilder::new("report")
///     .step(|s| s.id("fetch").kind(StepKind::Tool).target("http_get"))
///     .step(|s| s.id("summarize").kind(StepKind::Llm).target("gpt").depends_on("fetch"))
///     .build()
///     .unwrap();
/// assert_eq!(plan.steps.len(), 2);
/// ```
#[derive(Debug)]
pub struct PlanBuilder {
    id: String,
    strategy: ExecutionStrategy,
    metadata: HashMap<String, Value>,
    steps: Vec<ExecutionStep>,
    /// First value that failed to serialize; reported by `build`
    error: Option<ConvoyError>,
}

impl PlanBuilder {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            strategy: ExecutionStrategy::default(),
            metadata: HashMap::new(),
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(json_value) => {
                self.metadata.insert(key, json_value);
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Plan metadata value failed to serialize");
                self.error.get_or_insert(err.into());
            }
        }
        self
    }

    /// Add a step configured through a [`StepBuilder`]
    pub fn step<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(StepBuilder) -> StepBuilder,
    {
        let (step, error) = configure(StepBuilder::new()).finish();
        if let Some(err) = error {
            self.error.get_or_insert(err);
        }
        self.steps.push(step);
        self
    }

    /// Add an already constructed step
    pub fn add_step(mut self, step: ExecutionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a dependency edge between two steps already in the builder
    pub fn depends_on<S1, S2>(mut self, step: S1, dependency: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let step_id = step.into();
        let dep_id = dependency.into();

        if let Some(step) = self.steps.iter_mut().find(|s| s.id == step_id) {
            if !step.dependencies.contains(&dep_id) {
                step.dependencies.push(dep_id);
            }
        }
        self
    }

    /// Build and validate the plan.
    ///
    /// Fails on the first metadata or parameter value that could not be
    /// serialized, then on any structural problem.
    pub fn build(mut self) -> Result<ExecutionPlan> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let plan = self.build_unchecked();
        plan.validate()?;
        Ok(plan)
    }

    /// Build without validation; the engine still validates on submission
    pub fn build_unchecked(self) -> ExecutionPlan {
        if let Some(err) = &self.error {
            warn!(plan_id = %self.id, error = %err, "Building plan despite serialization failure");
        }
        ExecutionPlan {
            id: self.id,
            steps: self.steps,
            strategy: self.strategy,
            metadata: self.metadata,
        }
    }
}

/// Builder for individual steps
#[derive(Debug)]
pub struct StepBuilder {
    step: ExecutionStep,
    error: Option<ConvoyError>,
}

impl StepBuilder {
    fn new() -> Self {
        Self {
            step: ExecutionStep::new(String::new(), StepKind::default(), String::new()),
            error: None,
        }
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.step.id = id.into();
        self
    }

    pub fn kind(mut self, kind: StepKind) -> Self {
        self.step.kind = kind;
        self
    }

    pub fn target<S: Into<String>>(mut self, target: S) -> Self {
        self.step.target = target.into();
        self
    }

    pub fn parameters<T: Serialize>(mut self, parameters: T) -> Self {
        match serde_json::to_value(parameters) {
            Ok(value) => self.step.parameters = value,
            Err(err) => {
                warn!(step_id = %self.step.id, error = %err, "Step parameters failed to serialize");
                self.error.get_or_insert(err.into());
            }
        }
        self
    }

    pub fn depends_on<S: Into<String>>(mut self, dependency: S) -> Self {
        let dep = dependency.into();
        if !self.step.dependencies.contains(&dep) {
            self.step.dependencies.push(dep);
        }
        self
    }

    pub fn depends_on_all<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in dependencies {
            self = self.depends_on(dep);
        }
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.step.timeout = Some(duration);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.step.retries = Some(retries);
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.step.on_error = on_error;
        self
    }

    /// Continue past failure, recording `value` as the step's output
    pub fn fallback<T: Serialize>(mut self, value: T) -> Self {
        self.step.on_error = OnError::Fallback;
        match serde_json::to_value(value) {
            Ok(value) => self.step.fallback = Some(value),
            Err(err) => {
                warn!(step_id = %self.step.id, error = %err, "Step fallback failed to serialize");
                self.error.get_or_insert(err.into());
            }
        }
        self
    }

    fn finish(mut self) -> (ExecutionStep, Option<ConvoyError>) {
        if self.step.id.is_empty() {
            self.step.id = gen_step_id(&self.step.target);
        }
        (self.step, self.error)
    }
}

fn gen_step_id(target: &str) -> String {
    let prefix = if target.is_empty() { "step" } else { target };
    format!("{}_{}", prefix, cuid2::create_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_builder_creates_plan_in_order() {
        let plan = PlanBuilder::new("p")
            .strategy(ExecutionStrategy::Sequential)
            .metadata("owner", "planner")
            .step(|s| s.id("a").kind(StepKind::Tool).target("search"))
            .step(|s| {
                s.id("b")
                    .kind(StepKind::Llm)
                    .target("gpt")
                    .parameters(json!({"temperature": 0.2}))
                    .depends_on("a")
                    .timeout(Duration::from_millis(500))
                    .retries(2)
            })
            .build()
            .unwrap();

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(plan.strategy, ExecutionStrategy::Sequential);
        assert_eq!(plan.metadata.get("owner"), Some(&json!("planner")));

        let b = plan.step("b").unwrap();
        assert_eq!(b.dependencies, vec!["a".to_string()]);
        assert_eq!(b.timeout, Some(Duration::from_millis(500)));
        assert_eq!(b.retries, Some(2));
    }

    #[test]
    fn test_generated_step_ids() {
        let plan = PlanBuilder::new("p")
            .step(|s| s.target("search"))
            .step(|s| s.target("search"))
            .build()
            .unwrap();

        assert!(plan.steps[0].id.starts_with("search_"));
        assert_ne!(plan.steps[0].id, plan.steps[1].id);
    }

    #[test]
    fn test_fallback_sets_policy() {
        let plan = PlanBuilder::new("p")
            .step(|s| s.id("a").target("t").fallback("default"))
            .build()
            .unwrap();
        assert_eq!(plan.steps[0].on_error, OnError::Fallback);
        assert_eq!(plan.steps[0].fallback, Some(json!("default")));
    }

    #[test]
    fn test_build_rejects_dangling_dependency() {
        let result = PlanBuilder::new("p")
            .step(|s| s.id("a").target("t"))
            .depends_on("a", "missing")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_unserializable_values_fail_build() {
        // JSON object keys must be strings
        let tuple_keys: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);

        let err = PlanBuilder::new("p")
            .step(|s| s.id("a").target("t").parameters(&tuple_keys))
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "serialization");

        let err = PlanBuilder::new("p")
            .metadata("bad", &tuple_keys)
            .step(|s| s.id("a").target("t"))
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "serialization");

        let plan = PlanBuilder::new("p")
            .step(|s| s.id("a").target("t").parameters(&tuple_keys))
            .build_unchecked();
        assert_eq!(plan.steps[0].parameters, Value::Null);
    }
}
