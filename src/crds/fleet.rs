//! `Fleet` custom resource: a label-selected group of agents sharing bus
//! infrastructure, defaults and operational policy.

use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::agent::{AgentArsenal, AgentPhase, AgentResources, AgentVault};
use super::Condition;

fn default_bus_url() -> String {
    "nats://nats.fleet.svc:4222".to_string()
}

fn default_retention() -> StreamRetention {
    StreamRetention::WorkQueue
}

fn default_task_timeout() -> i32 {
    120
}

fn default_concurrency() -> i32 {
    2
}

fn default_cost_budget() -> String {
    "0".to_string()
}

fn default_max_missions() -> i32 {
    5
}

/// Retention policy for auto-created streams.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub enum StreamRetention {
    Limits,
    Interest,
    WorkQueue,
}

/// Shared NATS infrastructure for a fleet.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetBus {
    /// NATS server URL.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Subject prefix for all fleet traffic (e.g. "fleet-a").
    pub subject_prefix: String,

    /// JetStream stream name for tasks.
    pub tasks_stream: String,

    /// JetStream stream name for results.
    pub results_stream: String,

    /// Create/verify the streams during reconciliation.
    #[serde(default)]
    pub create_streams: bool,

    #[serde(default = "default_retention")]
    pub stream_retention: StreamRetention,
}

/// Defaults inherited by agents in the fleet.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default = "default_task_timeout")]
    pub task_timeout: i32,

    #[serde(default = "default_concurrency")]
    pub concurrency: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<AgentResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arsenal: Option<AgentArsenal>,
}

/// Fleet-level operational policies.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetPolicies {
    /// Max total concurrent tasks across the fleet; 0 means unlimited.
    #[serde(default)]
    pub max_concurrent_tasks: i32,

    /// Max cumulative cost in USD as a decimal string; "0" means unlimited.
    #[serde(default = "default_cost_budget")]
    pub cost_budget_usd: String,

    /// Cron expression for resetting the cost counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_reset_schedule: Option<String>,

    /// Max agents allowed in the fleet; 0 means unlimited.
    #[serde(default)]
    pub max_agents: i32,

    /// Max concurrent active missions.
    #[serde(default = "default_max_missions")]
    pub max_missions: i32,
}

/// `Fleet` CRD, the top-level organizational resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Fleet")]
#[kube(namespaced)]
#[kube(status = "FleetStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.agentsReady"}"#)]
#[kube(printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.agentsTotal"}"#)]
#[kube(printcolumn = r#"{"name":"Tasks","type":"integer","jsonPath":".status.totalTasksCompleted"}"#)]
#[kube(printcolumn = r#"{"name":"Cost","type":"string","jsonPath":".status.totalCost"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    /// Human-readable purpose of the fleet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Shared bus infrastructure.
    pub bus: FleetBus,

    /// Defaults applied to member agents (pull-based; agents consult the
    /// fleet, the fleet never mutates agents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<FleetDefaults>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<FleetPolicies>,

    /// Label selector for member agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_selector: Option<LabelSelector>,

    /// Shared secrets available to member agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<LocalObjectReference>,

    /// Shared vault for member agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<AgentVault>,

    #[serde(default)]
    pub suspended: bool,
}

/// Coarse lifecycle phase of a Fleet.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub enum FleetPhase {
    #[default]
    Provisioning,
    Ready,
    Degraded,
    Suspended,
    OverBudget,
}

/// Aggregated view of one member agent.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetAgentSummary {
    pub name: String,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub phase: AgentPhase,
}

/// Observed state of a Fleet.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    #[serde(default)]
    pub phase: FleetPhase,

    #[serde(default)]
    pub agents_ready: i32,

    #[serde(default)]
    pub agents_total: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<FleetAgentSummary>,

    /// Aggregate tasks completed across member agents.
    #[serde(default)]
    pub total_tasks_completed: i64,

    /// Aggregate cost in USD since the last reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<String>,

    /// Missions under this fleet in an active phase.
    #[serde(default)]
    pub active_missions: i32,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: FleetSpec = serde_json::from_value(serde_json::json!({
            "bus": {
                "subjectPrefix": "fleet-a",
                "tasksStream": "fleet_a_tasks",
                "resultsStream": "fleet_a_results"
            }
        }))
        .unwrap();
        assert_eq!(spec.bus.stream_retention, StreamRetention::WorkQueue);
        assert!(!spec.bus.create_streams);
        assert!(spec.policies.is_none());
    }

    #[test]
    fn policies_default_budget_is_unlimited() {
        let policies: FleetPolicies = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(policies.cost_budget_usd, "0");
        assert_eq!(policies.max_missions, 5);
    }
}
