//! Structural checks and wave computation over a plan's dependency graph.

use super::types::{ExecutionPlan, ExecutionStep};
use crate::core::errors::{ConvoyError, Result};
use std::collections::HashSet;

/// Reject plans with empty or duplicate step ids, or dependencies that do not
/// name another step of the same plan.
///
/// An empty target is allowed; the invoker may resolve the step by kind.
///
/// Cycles are not detected here; the scheduler reports them when no step
/// becomes ready.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<()> {
    let mut seen = HashSet::with_capacity(plan.steps.len());

    for step in &plan.steps {
        if step.id.is_empty() {
            return Err(ConvoyError::validation("Step ID cannot be empty"));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ConvoyError::validation_step(
                format!("Duplicate step id '{}'", step.id),
                step.id.clone(),
            ));
        }
    }

    for step in &plan.steps {
        for dep in &step.dependencies {
            if dep == &step.id {
                return Err(ConvoyError::validation_step(
                    format!("Step '{}' depends on itself", step.id),
                    step.id.clone(),
                ));
            }
            if !seen.contains(dep.as_str()) {
                return Err(ConvoyError::validation_step(
                    format!("Step '{}' depends on non-existent step '{}'", step.id, dep),
                    step.id.clone(),
                ));
            }
        }
    }

    Ok(())
}

/// Steps not yet finished whose every dependency is finished, in plan order.
pub fn ready_steps<'a>(
    steps: &'a [ExecutionStep],
    finished: &HashSet<String>,
) -> Vec<&'a ExecutionStep> {
    steps
        .iter()
        .filter(|step| !finished.contains(&step.id))
        .filter(|step| step.dependencies.iter().all(|dep| finished.contains(dep)))
        .collect()
}

/// Ids of the steps that can never become ready, in plan order.
pub fn stranded_steps(steps: &[ExecutionStep], finished: &HashSet<String>) -> Vec<String> {
    steps
        .iter()
        .filter(|step| !finished.contains(&step.id))
        .map(|step| step.id.clone())
        .collect()
}

/// Group steps into the waves the scheduler would dispatch when every step
/// produces a result.
pub fn compute_waves(steps: &[ExecutionStep]) -> Result<Vec<Vec<String>>> {
    let mut finished: HashSet<String> = HashSet::with_capacity(steps.len());
    let mut waves = Vec::new();

    while finished.len() < steps.len() {
        let wave: Vec<String> = ready_steps(steps, &finished)
            .into_iter()
            .map(|step| step.id.clone())
            .collect();

        if wave.is_empty() {
            return Err(ConvoyError::circular_dependency(stranded_steps(
                steps, &finished,
            )));
        }

        finished.extend(wave.iter().cloned());
        waves.push(wave);
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::StepKind;
    use pretty_assertions::assert_eq;

    fn step(id: &str, deps: &[&str]) -> ExecutionStep {
        ExecutionStep::new(id, StepKind::Skill, "target").with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let plan = ExecutionPlan::new("p", vec![step("a", &[]), step("a", &[])]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(matches!(
            err,
            ConvoyError::Validation { step_id: Some(ref id), .. } if id == "a"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let plan = ExecutionPlan::new("p", vec![step("a", &["ghost"])]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let plan = ExecutionPlan::new("p", vec![step("a", &["a"])]);
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn test_empty_target_allowed() {
        let plan = ExecutionPlan::new("p", vec![ExecutionStep::new("a", StepKind::Tool, "")]);
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn test_cycle_passes_validation() {
        let plan = ExecutionPlan::new("p", vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn test_compute_waves() {
        let steps = vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
            step("d", &["a"]),
            step("e", &["c", "d"]),
        ];
        let waves = compute_waves(&steps).unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string()],
                vec!["e".to_string()],
            ]
        );
    }

    #[test]
    fn test_compute_waves_reports_stranded_steps() {
        let steps = vec![step("root", &[]), step("a", &["b"]), step("b", &["a"])];
        let err = compute_waves(&steps).unwrap_err();
        match err {
            ConvoyError::CircularDependency { stranded } => {
                assert_eq!(stranded, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_plan_has_no_waves() {
        assert!(compute_waves(&[]).unwrap().is_empty());
    }
}
