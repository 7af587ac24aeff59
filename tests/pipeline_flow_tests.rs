//! Pipeline execution-order tests over the public DAG and template APIs.
//!
//! These simulate the dispatch loop the controller runs against the bus:
//! a step becomes dispatchable only when every dependency has settled.

use std::collections::HashMap;

use fleet_operator::controllers::pipeline::dag;
use fleet_operator::controllers::pipeline::template;
use fleet_operator::crds::pipeline::{PipelineSpec, StepPhase, StepStatus};

fn spec(json: serde_json::Value) -> PipelineSpec {
    serde_json::from_value(json).unwrap()
}

fn diamond() -> PipelineSpec {
    spec(serde_json::json!({
        "steps": [
            {"name": "a", "agentRef": "archivist", "task": "gather"},
            {"name": "b", "agentRef": "archivist", "task": "analyze left", "dependsOn": ["a"]},
            {"name": "c", "agentRef": "archivist", "task": "analyze right", "dependsOn": ["a"]},
            {"name": "d", "agentRef": "archivist", "task": "merge", "dependsOn": ["b", "c"]}
        ]
    }))
}

/// Steps whose dependencies are all settled, in spec order.
fn dispatchable(spec: &PipelineSpec, statuses: &[StepStatus]) -> Vec<String> {
    let status_map: HashMap<&str, &StepStatus> =
        statuses.iter().map(|s| (s.name.as_str(), s)).collect();
    let spec_map: HashMap<&str, &fleet_operator::crds::pipeline::PipelineStep> =
        spec.steps.iter().map(|s| (s.name.as_str(), s)).collect();

    spec.steps
        .iter()
        .filter(|step| {
            status_map
                .get(step.name.as_str())
                .is_some_and(|s| s.phase == StepPhase::Pending)
                && dag::dependencies_satisfied(step, &status_map, &spec_map)
        })
        .map(|step| step.name.clone())
        .collect()
}

fn mark(statuses: &mut [StepStatus], name: &str, phase: StepPhase) {
    let entry = statuses.iter_mut().find(|s| s.name == name).unwrap();
    entry.phase = phase;
}

#[test]
fn diamond_dispatch_respects_the_partial_order() {
    let spec = diamond();
    let mut statuses: Vec<StepStatus> = spec
        .steps
        .iter()
        .map(|s| StepStatus {
            name: s.name.clone(),
            ..StepStatus::default()
        })
        .collect();

    assert!(dag::validate(&spec.steps).is_ok());

    // Wave 1: only the root.
    assert_eq!(dispatchable(&spec, &statuses), vec!["a"]);

    // a completes -> the fan-out pair becomes ready; d still waits.
    mark(&mut statuses, "a", StepPhase::Succeeded);
    assert_eq!(dispatchable(&spec, &statuses), vec!["b", "c"]);

    // One branch done is not enough for the fan-in.
    mark(&mut statuses, "b", StepPhase::Succeeded);
    mark(&mut statuses, "c", StepPhase::Running);
    assert_eq!(dispatchable(&spec, &statuses), Vec::<String>::new());

    // Both branches done -> d dispatches.
    mark(&mut statuses, "c", StepPhase::Succeeded);
    assert_eq!(dispatchable(&spec, &statuses), vec!["d"]);
}

#[test]
fn cyclic_specs_never_become_dispatchable() {
    let spec = spec(serde_json::json!({
        "steps": [
            {"name": "a", "agentRef": "archivist", "task": "t", "dependsOn": ["b"]},
            {"name": "b", "agentRef": "archivist", "task": "t", "dependsOn": ["a"]}
        ]
    }));

    let err = dag::validate(&spec.steps).unwrap_err();
    assert_eq!(err.reason(), "CyclicDependency");

    // Even ignoring validation, neither step's gate ever opens.
    let statuses: Vec<StepStatus> = spec
        .steps
        .iter()
        .map(|s| StepStatus {
            name: s.name.clone(),
            ..StepStatus::default()
        })
        .collect();
    assert!(dispatchable(&spec, &statuses).is_empty());
}

#[test]
fn data_flows_from_input_and_upstream_outputs() {
    let spec = spec(serde_json::json!({
        "input": "seed",
        "steps": [
            {"name": "a", "agentRef": "archivist", "task": "produce"},
            {
                "name": "b",
                "agentRef": "archivist",
                "task": "consume: {{input}} / {{steps.a.output}}",
                "dependsOn": ["a"]
            }
        ]
    }));

    let statuses = vec![StepStatus {
        name: "a".to_string(),
        phase: StepPhase::Succeeded,
        output: Some("alpha".to_string()),
        ..StepStatus::default()
    }];

    let rendered = template::render_task(&spec, &statuses, &spec.steps[1].task).unwrap();
    assert_eq!(rendered, "consume: seed / alpha");
}

#[test]
fn continue_on_failure_opens_the_gate_downstream() {
    let spec = spec(serde_json::json!({
        "steps": [
            {"name": "flaky", "agentRef": "archivist", "task": "t", "continueOnFailure": true},
            {"name": "after", "agentRef": "archivist", "task": "t", "dependsOn": ["flaky"]}
        ]
    }));

    let statuses = vec![
        StepStatus {
            name: "flaky".to_string(),
            phase: StepPhase::Failed,
            error: Some("boom".to_string()),
            ..StepStatus::default()
        },
        StepStatus {
            name: "after".to_string(),
            ..StepStatus::default()
        },
    ];

    assert_eq!(dispatchable(&spec, &statuses), vec!["after"]);
}
