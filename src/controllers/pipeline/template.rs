//! Task-string templating for inter-step data flow.
//!
//! Steps see the pipeline input as `{{input}}` and prior step results as
//! `{{steps.<key>.output}}` / `{{steps.<key>.error}}`, where `<key>` is the
//! step's `outputKey` (step name by default).

use handlebars::Handlebars;
use serde_json::{json, Map, Value};

use crate::controllers::types::{Error, Result};
use crate::crds::pipeline::{PipelineSpec, StepStatus};

/// Render one step's task string. A task without `{{` passes through
/// untouched.
pub fn render_task(spec: &PipelineSpec, statuses: &[StepStatus], task: &str) -> Result<String> {
    if !task.contains("{{") {
        return Ok(task.to_string());
    }

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars
        .register_template_string("task", task)
        .map_err(|e| Error::Template(format!("template parse error: {e}")))?;

    let mut steps = Map::new();
    for status in statuses {
        let key = spec
            .steps
            .iter()
            .find(|s| s.name == status.name)
            .and_then(|s| s.output_key.clone())
            .unwrap_or_else(|| status.name.clone());
        steps.insert(
            key,
            json!({
                "output": status.output.clone().unwrap_or_default(),
                "error": status.error.clone().unwrap_or_default()
            }),
        );
    }

    let data = json!({
        "input": spec.input.clone().unwrap_or_default(),
        "steps": Value::Object(steps)
    });

    handlebars
        .render("task", &data)
        .map_err(|e| Error::Template(format!("template render error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::pipeline::StepPhase;

    fn spec_with_input(input: &str) -> PipelineSpec {
        serde_json::from_value(serde_json::json!({
            "input": input,
            "steps": [
                {"name": "a", "agentRef": "k", "task": "first"},
                {"name": "b", "agentRef": "k", "task": "second", "dependsOn": ["a"]}
            ]
        }))
        .unwrap()
    }

    fn succeeded(name: &str, output: &str) -> StepStatus {
        StepStatus {
            name: name.to_string(),
            phase: StepPhase::Succeeded,
            output: Some(output.to_string()),
            ..StepStatus::default()
        }
    }

    #[test]
    fn plain_tasks_pass_through() {
        let spec = spec_with_input("seed");
        let rendered = render_task(&spec, &[], "plain task with no templates").unwrap();
        assert_eq!(rendered, "plain task with no templates");
    }

    #[test]
    fn renders_input_and_step_outputs() {
        let spec = spec_with_input("seed");
        let statuses = vec![succeeded("a", "alpha")];
        let rendered = render_task(
            &spec,
            &statuses,
            "consume: {{input}} / {{steps.a.output}}",
        )
        .unwrap();
        assert_eq!(rendered, "consume: seed / alpha");
    }

    #[test]
    fn output_key_aliases_the_step() {
        let mut spec = spec_with_input("seed");
        spec.steps[0].output_key = Some("scan".to_string());
        let statuses = vec![succeeded("a", "alpha")];
        let rendered = render_task(&spec, &statuses, "got {{steps.scan.output}}").unwrap();
        assert_eq!(rendered, "got alpha");
    }

    #[test]
    fn step_errors_are_exposed() {
        let spec = spec_with_input("");
        let failed = StepStatus {
            name: "a".to_string(),
            phase: StepPhase::Failed,
            error: Some("boom".to_string()),
            ..StepStatus::default()
        };
        let rendered = render_task(&spec, &[failed], "upstream said {{steps.a.error}}").unwrap();
        assert_eq!(rendered, "upstream said boom");
    }

    #[test]
    fn malformed_templates_error() {
        let spec = spec_with_input("");
        let err = render_task(&spec, &[], "broken {{#if}}").unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }
}
