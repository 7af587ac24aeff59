//! `Pipeline` custom resource: a declarative DAG of tasks dispatched to
//! named Agents over the message bus.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

fn default_pipeline_timeout() -> i32 {
    600
}

fn default_step_timeout() -> i32 {
    120
}

fn default_backoff_seconds() -> i32 {
    30
}

/// A single step in the pipeline.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// Unique name within the pipeline.
    pub name: String,

    /// Name of the Agent (same namespace) that executes this step.
    pub agent_ref: String,

    /// Task prompt. Supports handlebars substitution over `{{input}}` and
    /// `{{steps.<name>.output}}` / `{{steps.<name>.error}}`.
    pub task: String,

    /// Steps that must complete before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-step timeout in seconds (10-3600).
    #[serde(default = "default_step_timeout")]
    pub timeout: i32,

    /// Key under which the output is stored for downstream steps; defaults
    /// to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    /// Allow downstream steps to proceed even if this step fails.
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// Retry behavior for failed steps.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRetryPolicy {
    /// Maximum retries per step (0-5).
    #[serde(default)]
    pub max_retries: i32,

    /// Delay between retries in seconds.
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: i32,
}

/// `Pipeline` CRD, a multi-agent task DAG.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Pipeline")]
#[kube(namespaced)]
#[kube(status = "PipelineStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(printcolumn = r#"{"name":"Runs","type":"integer","jsonPath":".status.runsCompleted"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Human-readable summary of what this pipeline accomplishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Ordered list of steps forming the DAG.
    pub steps: Vec<PipelineStep>,

    /// Overall timeout in seconds (30-86400).
    #[serde(default = "default_pipeline_timeout")]
    pub timeout: i32,

    /// Optional cron expression for recurring runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Initial data exposed to step templates as `{{input}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Fleet providing the bus subject prefix; defaults to `fleet-a`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_ref: Option<String>,

    /// Prevent scheduled and new executions.
    #[serde(default)]
    pub suspended: bool,

    /// Retry behavior for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<PipelineRetryPolicy>,
}

/// Coarse lifecycle phase of a Pipeline.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub enum PipelinePhase {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Suspended,
}

/// Execution phase of one step.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub enum StepPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Execution status of one step.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// Matches the step name from the spec.
    pub name: String,

    #[serde(default)]
    pub phase: StepPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Result data from this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Retry attempts made in the current run.
    #[serde(default)]
    pub retries: i32,
}

/// Observed state of a Pipeline.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    #[serde(default)]
    pub phase: PipelinePhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_statuses: Vec<StepStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Total successful runs.
    #[serde(default)]
    pub runs_completed: i64,

    /// Total failed runs.
    #[serde(default)]
    pub runs_failed: i64,

    /// Last cron-triggered start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<String>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PipelineStatus {
    /// Fresh step statuses, all Pending, matching the spec order.
    #[must_use]
    pub fn fresh_steps(spec: &PipelineSpec) -> Vec<StepStatus> {
        spec.steps
            .iter()
            .map(|step| StepStatus {
                name: step.name.clone(),
                ..StepStatus::default()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: PipelineSpec = serde_json::from_value(serde_json::json!({
            "steps": [
                {"name": "scan", "agentRef": "sentinel", "task": "scan the network"}
            ]
        }))
        .unwrap();
        assert_eq!(spec.timeout, 600);
        assert_eq!(spec.steps[0].timeout, 120);
        assert!(!spec.steps[0].continue_on_failure);
        assert!(spec.retry_policy.is_none());
    }

    #[test]
    fn fresh_steps_are_all_pending() {
        let spec: PipelineSpec = serde_json::from_value(serde_json::json!({
            "steps": [
                {"name": "a", "agentRef": "k", "task": "t"},
                {"name": "b", "agentRef": "k", "task": "t", "dependsOn": ["a"]}
            ]
        }))
        .unwrap();
        let steps = PipelineStatus::fresh_steps(&spec);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "a");
        assert_eq!(steps[0].phase, StepPhase::Pending);
        assert_eq!(steps[1].name, "b");
        assert_eq!(steps[1].phase, StepPhase::Pending);
    }

    #[test]
    fn terminal_phases() {
        assert!(StepPhase::Succeeded.is_terminal());
        assert!(StepPhase::Failed.is_terminal());
        assert!(StepPhase::Skipped.is_terminal());
        assert!(!StepPhase::Pending.is_terminal());
        assert!(!StepPhase::Running.is_terminal());
    }
}
