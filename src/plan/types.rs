use crate::core::duration::option_millis;
use crate::core::errors::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Advisory execution strategy attached by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    #[default]
    Parallel,
    Adaptive,
    RetryWithBackoff,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Adaptive => "adaptive",
            Self::RetryWithBackoff => "retry_with_backoff",
        }
    }
}

/// What the step's action is, as far as the planner is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Skill,
    Tool,
    Llm,
    Condition,
    Parallel,
    Sequence,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skill => "skill",
            Self::Tool => "tool",
            Self::Llm => "llm",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Sequence => "sequence",
        }
    }
}

/// How a step failure affects the rest of the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop scheduling further waves
    #[default]
    Fail,
    /// Record the failure and keep going
    Skip,
    /// Record the failure with the step's fallback output and keep going
    Fallback,
}

/// A single unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    #[serde(default)]
    pub kind: StepKind,
    /// Name of the skill/tool/model invoked; also the circuit-breaker partition key
    pub target: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, rename = "timeout_ms", with = "option_millis")]
    pub timeout: Option<Duration>,
    /// Overrides the retry policy's `max_retries` for this step
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub on_error: OnError,
    /// Output recorded when the step fails under [`OnError::Fallback`]
    #[serde(default)]
    pub fallback: Option<Value>,
}

impl ExecutionStep {
    pub fn new(id: impl Into<String>, kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: target.into(),
            parameters: Value::Null,
            dependencies: Vec::new(),
            timeout: None,
            retries: None,
            on_error: OnError::default(),
            fallback: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// A planner-produced set of steps with declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionPlan {
    pub fn new(id: impl Into<String>, steps: Vec<ExecutionStep>) -> Self {
        Self {
            id: id.into(),
            steps,
            strategy: ExecutionStrategy::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check unique ids and resolvable dependencies
    pub fn validate(&self) -> Result<()> {
        super::graph::validate_plan(self)
    }

    /// The waves the scheduler would run if every step succeeded
    pub fn wave_preview(&self) -> Result<Vec<Vec<String>>> {
        super::graph::compute_waves(&self.steps)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::io(format!("read plan {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const PLAN_YAML: &str = r#"
id: research
strategy: parallel
steps:
  - id: search
    kind: tool
    target: web_search
    parameters:
      query: rust circuit breakers
    timeout_ms: 5000
  - id: summarize
    kind: llm
    target: gpt
    dependencies: [search]
    retries: 1
    on_error: fallback
    fallback: "no summary"
"#;

    #[test]
    fn test_plan_from_yaml() {
        let plan = ExecutionPlan::from_yaml_str(PLAN_YAML).unwrap();
        assert_eq!(plan.id, "research");
        assert_eq!(plan.strategy, ExecutionStrategy::Parallel);
        assert_eq!(plan.steps.len(), 2);

        let search = plan.step("search").unwrap();
        assert_eq!(search.kind, StepKind::Tool);
        assert_eq!(search.timeout, Some(Duration::from_secs(5)));
        assert_eq!(search.parameters, json!({"query": "rust circuit breakers"}));
        assert_eq!(search.on_error, OnError::Fail);

        let summarize = plan.step("summarize").unwrap();
        assert_eq!(summarize.dependencies, vec!["search".to_string()]);
        assert_eq!(summarize.retries, Some(1));
        assert_eq!(summarize.on_error, OnError::Fallback);
        assert_eq!(summarize.fallback, Some(json!("no summary")));
    }

    #[test]
    fn test_plan_json_uses_snake_case_tags() {
        let plan = ExecutionPlan::new(
            "p",
            vec![ExecutionStep::new("a", StepKind::Llm, "model").with_on_error(OnError::Skip)],
        )
        .with_strategy(ExecutionStrategy::RetryWithBackoff);

        let value: Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
        assert_eq!(value["strategy"], json!("retry_with_backoff"));
        assert_eq!(value["steps"][0]["kind"], json!("llm"));
        assert_eq!(value["steps"][0]["on_error"], json!("skip"));

        let back = ExecutionPlan::from_json_str(&plan.to_json().unwrap()).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_missing_plan_file() {
        let err = ExecutionPlan::from_yaml_file("/definitely/not/here.yaml").unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
