//! DAG planning.
//!
//! Computes a topological layering of the step list: level 0 holds every
//! step without dependencies, level k+1 every step whose dependencies all
//! sit in levels ≤ k. Planning is the only place step identity and
//! dependency integrity are checked, and it is deterministic: the same
//! definition always yields the same levels, with declaration order kept
//! inside each level.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::WorkflowStep;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle involving step(s): {0}")]
    Cycle(String),
}

/// Levelled execution order; entries are indices into the step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<usize>>,
}

pub fn plan(steps: &[WorkflowStep]) -> Result<ExecutionPlan, PlanError> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        if index_of.insert(step.id.as_str(), index).is_some() {
            return Err(PlanError::DuplicateStepId(step.id.clone()));
        }
    }
    for step in steps {
        for dependency in &step.depends_on {
            if !index_of.contains_key(dependency.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut level_of: Vec<Option<usize>> = vec![None; steps.len()];
    let mut assigned = 0;
    while assigned < steps.len() {
        let mut progressed = false;
        for (index, step) in steps.iter().enumerate() {
            if level_of[index].is_some() {
                continue;
            }
            let mut level = 0;
            let mut ready = true;
            for dependency in &step.depends_on {
                match level_of[index_of[dependency.as_str()]] {
                    Some(dep_level) => level = level.max(dep_level + 1),
                    None => {
                        ready = false;
                        break;
                    }
                }
            }
            if ready {
                level_of[index] = Some(level);
                assigned += 1;
                progressed = true;
            }
        }
        if !progressed {
            let stuck: Vec<&str> = steps
                .iter()
                .enumerate()
                .filter(|(index, _)| level_of[*index].is_none())
                .map(|(_, step)| step.id.as_str())
                .collect();
            return Err(PlanError::Cycle(stuck.join(", ")));
        }
    }

    let depth = level_of.iter().flatten().copied().max().map_or(0, |d| d + 1);
    let mut levels = vec![Vec::new(); depth];
    for (index, level) in level_of.iter().enumerate() {
        if let Some(level) = level {
            levels[*level].push(index);
        }
    }
    Ok(ExecutionPlan { levels })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, "tool")
            .with_depends_on(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn linear_chain_layers_one_per_level() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let plan = plan(&steps).unwrap();
        assert_eq!(plan.levels, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn fan_out_fan_in() {
        let steps = vec![
            step("add-five", &[]),
            step("add-ten", &[]),
            step("timestamp", &[]),
            step("summary", &["add-five", "add-ten", "timestamp"]),
        ];
        let plan = plan(&steps).unwrap();
        assert_eq!(plan.levels, vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn declaration_order_kept_within_level() {
        let steps = vec![step("z", &[]), step("a", &[]), step("m", &[])];
        let plan = plan(&steps).unwrap();
        assert_eq!(plan.levels, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn planning_is_deterministic() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let first = plan(&steps).unwrap();
        for _ in 0..10 {
            assert_eq!(plan(&steps).unwrap(), first);
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert_eq!(
            plan(&steps).unwrap_err(),
            PlanError::DuplicateStepId("a".to_string())
        );
    }

    #[test]
    fn unknown_dependency_rejected() {
        let steps = vec![step("b", &["missing"])];
        assert!(matches!(
            plan(&steps).unwrap_err(),
            PlanError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn cycle_rejected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(matches!(plan(&steps).unwrap_err(), PlanError::Cycle(_)));
    }

    #[test]
    fn empty_workflow_has_no_levels() {
        let plan = plan(&[]).unwrap();
        assert!(plan.levels.is_empty());
    }
}
