//! Plan data model: steps, dependencies, builders and loaders.

pub mod builder;
pub mod graph;
pub mod types;

pub use builder::{PlanBuilder, StepBuilder};
pub use graph::{compute_waves, validate_plan};
pub use types::{ExecutionPlan, ExecutionStep, ExecutionStrategy, OnError, StepKind};
