//! Step-graph validation and readiness.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::crds::pipeline::{PipelineStep, StepPhase, StepStatus};

#[derive(Error, Debug, PartialEq)]
pub enum DagError {
    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownStep { step: String, dependency: String },

    #[error("step graph contains a cycle")]
    Cycle,

    #[error("duplicate step name {name:?}")]
    DuplicateStep { name: String },
}

impl DagError {
    /// Condition reason for this validation failure.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownStep { .. } => "UnknownStep",
            Self::Cycle => "CyclicDependency",
            Self::DuplicateStep { .. } => "DuplicateStep",
        }
    }
}

/// Kahn-style topological check over the `dependsOn` edges. Rejects
/// duplicate names, references to unknown steps, and cycles.
pub fn validate(steps: &[PipelineStep]) -> Result<(), DagError> {
    let mut names = HashSet::new();
    for step in steps {
        if !names.insert(step.name.as_str()) {
            return Err(DagError::DuplicateStep {
                name: step.name.clone(),
            });
        }
    }

    for step in steps {
        for dependency in &step.depends_on {
            if !names.contains(dependency.as_str()) {
                return Err(DagError::UnknownStep {
                    step: step.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut drained = 0;
    while let Some(node) = queue.pop_front() {
        drained += 1;
        for step in steps {
            let edges = step.depends_on.iter().filter(|d| d.as_str() == node).count();
            if edges == 0 {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(step.name.as_str()) {
                *degree = degree.saturating_sub(edges);
                if *degree == 0 {
                    queue.push_back(step.name.as_str());
                }
            }
        }
    }

    if drained != steps.len() {
        return Err(DagError::Cycle);
    }
    Ok(())
}

/// Whether every dependency of `step` is Succeeded, or Failed with
/// `continueOnFailure` set on the dependency.
#[must_use]
pub fn dependencies_satisfied(
    step: &PipelineStep,
    statuses: &HashMap<&str, &StepStatus>,
    specs: &HashMap<&str, &PipelineStep>,
) -> bool {
    step.depends_on.iter().all(|dependency| {
        let Some(status) = statuses.get(dependency.as_str()) else {
            return false;
        };
        match status.phase {
            StepPhase::Succeeded => true,
            StepPhase::Failed => specs
                .get(dependency.as_str())
                .is_some_and(|spec| spec.continue_on_failure),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends_on: &[&str]) -> PipelineStep {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "agentRef": "sentinel",
            "task": format!("task-{name}"),
            "dependsOn": depends_on
        }))
        .unwrap()
    }

    #[test]
    fn accepts_a_diamond() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        assert_eq!(validate(&steps), Ok(()));
    }

    #[test]
    fn rejects_a_cycle() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        assert_eq!(validate(&steps), Err(DagError::Cycle));
    }

    #[test]
    fn rejects_a_two_node_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert_eq!(validate(&steps), Err(DagError::Cycle));
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let steps = vec![step("a", &["nonexistent"])];
        let err = validate(&steps).unwrap_err();
        assert_eq!(err.reason(), "UnknownStep");
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert_eq!(
            validate(&steps).unwrap_err().reason(),
            "DuplicateStep"
        );
    }

    #[test]
    fn dependency_gate_waits_for_success() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let mut status_a = StepStatus {
            name: "a".to_string(),
            ..StepStatus::default()
        };

        let specs: HashMap<&str, &PipelineStep> =
            steps.iter().map(|s| (s.name.as_str(), s)).collect();

        status_a.phase = StepPhase::Running;
        let statuses: HashMap<&str, &StepStatus> = [("a", &status_a)].into();
        assert!(!dependencies_satisfied(&steps[1], &statuses, &specs));

        status_a.phase = StepPhase::Succeeded;
        let statuses: HashMap<&str, &StepStatus> = [("a", &status_a)].into();
        assert!(dependencies_satisfied(&steps[1], &statuses, &specs));
    }

    #[test]
    fn failed_dependency_passes_only_with_continue_on_failure() {
        let mut lenient = step("a", &[]);
        lenient.continue_on_failure = true;
        let strict = step("b", &[]);
        let downstream_of_a = step("c", &["a"]);
        let downstream_of_b = step("d", &["b"]);

        let failed_a = StepStatus {
            name: "a".to_string(),
            phase: StepPhase::Failed,
            ..StepStatus::default()
        };
        let failed_b = StepStatus {
            name: "b".to_string(),
            phase: StepPhase::Failed,
            ..StepStatus::default()
        };

        let specs: HashMap<&str, &PipelineStep> =
            [("a", &lenient), ("b", &strict)].into();
        let statuses: HashMap<&str, &StepStatus> =
            [("a", &failed_a), ("b", &failed_b)].into();

        assert!(dependencies_satisfied(&downstream_of_a, &statuses, &specs));
        assert!(!dependencies_satisfied(&downstream_of_b, &statuses, &specs));
    }
}
