//! `Mission` custom resource: an ephemeral, TTL-bounded team of agents
//! assembled around an objective.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::agent::AgentSpec;
use super::Condition;

fn default_ttl() -> i32 {
    3600
}

fn default_mission_timeout() -> i32 {
    1800
}

fn default_cleanup_policy() -> CleanupPolicy {
    CleanupPolicy::Delete
}

fn default_pipeline_phase() -> MissionPipelinePhase {
    MissionPipelinePhase::Active
}

/// An agent participating in a mission.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MissionAgent {
    /// Agent name. Resolved against existing Agent resources unless
    /// `ephemeral` is set.
    pub name: String,

    /// Role within the mission (e.g. "lead", "researcher").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Create a temporary Agent for this mission, cleaned up on completion.
    #[serde(default)]
    pub ephemeral: bool,

    /// Spec for the ephemeral agent; required when `ephemeral` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_spec: Option<AgentSpec>,
}

/// When in the mission lifecycle a referenced pipeline runs.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum MissionPipelinePhase {
    Setup,
    Active,
    Teardown,
}

/// Reference to a pipeline executed as part of the mission.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MissionPipelineRef {
    /// Pipeline resource name.
    pub name: String,

    /// Mission-specific input overriding the pipeline's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_override: Option<String>,

    #[serde(default = "default_pipeline_phase")]
    pub phase: MissionPipelinePhase,
}

/// What happens to mission resources after completion.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum CleanupPolicy {
    Delete,
    Retain,
}

/// `Mission` CRD, a time-bounded multi-agent engagement.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Mission")]
#[kube(namespaced)]
#[kube(status = "MissionStatus")]
#[kube(printcolumn = r#"{"name":"Objective","type":"string","jsonPath":".spec.objective","priority":1}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"TTL","type":"integer","jsonPath":".spec.ttl"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct MissionSpec {
    /// High-level goal of the mission.
    pub objective: String,

    /// How to judge mission success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,

    /// Participating agents.
    pub agents: Vec<MissionAgent>,

    /// Pipelines executed during the mission, by lifecycle phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipelines: Vec<MissionPipelineRef>,

    /// Time-to-live in seconds (60-604800); the mission is cleaned up after
    /// this regardless of completion.
    #[serde(default = "default_ttl")]
    pub ttl: i32,

    /// Maximum seconds to wait for the objective before failing (60-86400).
    #[serde(default = "default_mission_timeout")]
    pub timeout: i32,

    /// Override for the mission's bus subject prefix; defaults to
    /// `mission-<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_prefix: Option<String>,

    /// Fleet this mission is conducted under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_ref: Option<String>,

    #[serde(default = "default_cleanup_policy")]
    pub cleanup_policy: CleanupPolicy,

    /// Initial context published to all mission agents at start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub briefing: Option<String>,
}

/// Coarse lifecycle phase of a Mission.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub enum MissionPhase {
    #[default]
    Assembling,
    Briefing,
    Active,
    Succeeded,
    Failed,
    Expired,
    CleaningUp,
}

/// Per-agent status within the mission.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MissionAgentStatus {
    pub name: String,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub tasks_completed: i64,

    #[serde(default)]
    pub ephemeral: bool,
}

/// Observed state of a Mission.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MissionStatus {
    #[serde(default)]
    pub phase: MissionPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_statuses: Vec<MissionAgentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// When the mission will be auto-cleaned based on TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,

    /// Summary of the mission outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Cumulative cost in USD across mission agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<String>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Mission {
    /// Bus subject prefix for mission-scoped subjects (the briefing channel).
    #[must_use]
    pub fn bus_prefix(&self) -> String {
        self.spec.bus_prefix.clone().unwrap_or_else(|| {
            format!("mission-{}", self.metadata.name.as_deref().unwrap_or(""))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> MissionSpec {
        serde_json::from_value(serde_json::json!({
            "objective": "audit the perimeter",
            "agents": [{"name": "sentinel"}]
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults_apply() {
        let spec = minimal_spec();
        assert_eq!(spec.ttl, 3600);
        assert_eq!(spec.timeout, 1800);
        assert_eq!(spec.cleanup_policy, CleanupPolicy::Delete);
        assert!(!spec.agents[0].ephemeral);
    }

    #[test]
    fn pipeline_refs_default_to_active_phase() {
        let spec: MissionSpec = serde_json::from_value(serde_json::json!({
            "objective": "o",
            "agents": [{"name": "k"}],
            "pipelines": [{"name": "recon"}]
        }))
        .unwrap();
        assert_eq!(spec.pipelines[0].phase, MissionPipelinePhase::Active);
    }

    #[test]
    fn bus_prefix_defaults_to_mission_name() {
        let mission = Mission::new("red-team", minimal_spec());
        assert_eq!(mission.bus_prefix(), "mission-red-team");

        let mut overridden = Mission::new("red-team", minimal_spec());
        overridden.spec.bus_prefix = Some("wargames".to_string());
        assert_eq!(overridden.bus_prefix(), "wargames");
    }
}
