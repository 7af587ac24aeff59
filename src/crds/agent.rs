//! `Agent` custom resource: a specialized AI worker deployed as a pod with
//! task and skill sidecars, wired onto NATS JetStream.

use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar, LocalObjectReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Model used when neither the spec nor the owning Fleet names one.
pub const FALLBACK_MODEL: &str = "claude-sonnet-4-20250514";

/// Image used when neither the spec nor the owning Fleet names one.
pub const FALLBACK_IMAGE: &str = "ghcr.io/fleetops/pi-agent:latest";

fn default_bus_url() -> String {
    "nats://nats.fleet.svc:4222".to_string()
}

fn default_tasks_stream() -> String {
    "fleet_a_tasks".to_string()
}

fn default_results_stream() -> String {
    "fleet_a_results".to_string()
}

fn default_max_deliver() -> i32 {
    1
}

fn default_vault_claim() -> String {
    "shared-vault".to_string()
}

fn default_true() -> bool {
    true
}

fn default_writable_paths() -> Vec<String> {
    vec!["Briefings/".to_string(), "Fleet/".to_string()]
}

fn default_memory() -> String {
    "256Mi".to_string()
}

fn default_cpu() -> String {
    "200m".to_string()
}

fn default_concurrency() -> i32 {
    2
}

fn default_task_timeout() -> i32 {
    120
}

fn default_arsenal_ref() -> String {
    "main".to_string()
}

fn default_arsenal_period() -> String {
    "300s".to_string()
}

fn default_arsenal_image() -> String {
    "registry.k8s.io/git-sync/git-sync:v4.4.0".to_string()
}

fn default_workspace_size() -> String {
    "1Gi".to_string()
}

/// System-level tool packages provisioned into the agent pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct AgentTools {
    /// nixpkgs packages, compiled into a generated flake and cached on the
    /// nix-store volume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nix: Vec<String>,

    /// apt packages (requires root; prefer nix).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apt: Vec<String>,

    /// Tools installed via mise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mise: Vec<String>,
}

/// NATS JetStream connection and consumer settings for one agent.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentBus {
    /// NATS server URL.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Filter subjects for task consumption, e.g. `fleet-a.tasks.security.>`.
    pub subjects: Vec<String>,

    /// Stream the agent consumes tasks from.
    #[serde(default = "default_tasks_stream")]
    pub stream: String,

    /// Stream the agent publishes results to.
    #[serde(default = "default_results_stream")]
    pub results_stream: String,

    /// Override for the durable consumer name; defaults to `agent-<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,

    /// Maximum delivery attempts per message.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i32,
}

/// Shared knowledge vault mount.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentVault {
    /// PVC backing the shared vault.
    #[serde(default = "default_vault_claim")]
    pub claim_name: String,

    /// Mount the base vault read-only.
    #[serde(default = "default_true")]
    pub read_only: bool,

    /// Subpaths the agent may write to.
    #[serde(default = "default_writable_paths")]
    pub writable_paths: Vec<String>,
}

/// Overrides for the agent's system prompt components.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentPrompt {
    /// Persona/identity description (rendered as SOUL.md).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Additional instructions appended to the system prompt (AGENTS.md).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// External ConfigMap carrying prompt overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<LocalObjectReference>,
}

/// Compute limits for the agent container.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct AgentResources {
    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default = "default_cpu")]
    pub cpu: String,
}

impl Default for AgentResources {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

/// Skill-repo sync settings for the arsenal sidecar.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentArsenal {
    /// Git repository holding skill definitions.
    pub repo: String,

    #[serde(default = "default_arsenal_ref", rename = "ref")]
    pub git_ref: String,

    /// Sync period, e.g. "300s".
    #[serde(default = "default_arsenal_period")]
    pub period: String,

    #[serde(default = "default_arsenal_image")]
    pub image: String,
}

/// Persistent workspace settings.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkspace {
    /// Use an existing PVC instead of creating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_claim: Option<String>,

    /// Storage request for auto-created workspace PVCs.
    #[serde(default = "default_workspace_size")]
    pub size: String,
}

/// `Agent` CRD, a specialist worker in the fleet.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "agents.platform", version = "v1alpha1", kind = "Agent")]
#[kube(namespaced)]
#[kube(status = "AgentStatus")]
#[kube(printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#)]
#[kube(printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#)]
#[kube(printcolumn = r#"{"name":"Tasks","type":"integer","jsonPath":".status.tasksCompleted"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Area of expertise (e.g. "security", "research"). Drives subject
    /// routing and skill filtering.
    pub domain: String,

    /// AI model identifier. Unset means: take the owning Fleet's default,
    /// then [`FALLBACK_MODEL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Container image for the agent runtime. Unset means: take the owning
    /// Fleet's default, then [`FALLBACK_IMAGE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Skill categories this agent has access to.
    pub skills: Vec<String>,

    /// Additional system packages and tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<AgentTools>,

    /// Message-bus consumer configuration.
    pub bus: AgentBus,

    /// Shared vault mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<AgentVault>,

    /// System prompt overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<AgentPrompt>,

    /// Compute limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<AgentResources>,

    /// Maximum concurrent tasks (1-10).
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,

    /// Default task timeout in seconds (30-3600).
    #[serde(default = "default_task_timeout")]
    pub task_timeout: i32,

    /// Extra environment variables for the agent container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Environment sources (secrets, configmaps).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Skill arsenal git-sync sidecar configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arsenal: Option<AgentArsenal>,

    /// Persistent workspace configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<AgentWorkspace>,

    /// Scale the agent deployment to zero.
    #[serde(default)]
    pub suspended: bool,
}

/// Coarse lifecycle phase of an Agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub enum AgentPhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Degraded,
    Suspended,
}

/// Observed state of an Agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(default)]
    pub phase: AgentPhase,

    /// Whether the agent is ready to accept tasks.
    #[serde(default)]
    pub ready: bool,

    /// Total tasks completed since creation.
    #[serde(default)]
    pub tasks_completed: i64,

    /// Total tasks that failed.
    #[serde(default)]
    pub tasks_failed: i64,

    /// Timestamp of the last completed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_at: Option<String>,

    /// Cumulative cost in USD, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<String>,

    /// Name of the reconciled durable bus consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Agent {
    /// Durable consumer name: the spec override or `agent-<name>`.
    #[must_use]
    pub fn consumer_name(&self) -> String {
        self.spec
            .bus
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("agent-{}", self.metadata.name.as_deref().unwrap_or("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec_json() -> serde_json::Value {
        serde_json::json!({
            "domain": "security",
            "skills": ["recon"],
            "bus": {
                "subjects": ["fleet-a.tasks.security.>"]
            }
        })
    }

    #[test]
    fn spec_defaults_apply() {
        let spec: AgentSpec = serde_json::from_value(minimal_spec_json()).unwrap();
        assert!(spec.model.is_none());
        assert!(spec.image.is_none());
        assert_eq!(spec.concurrency, 2);
        assert_eq!(spec.task_timeout, 120);
        assert_eq!(spec.bus.stream, "fleet_a_tasks");
        assert_eq!(spec.bus.results_stream, "fleet_a_results");
        assert_eq!(spec.bus.max_deliver, 1);
        assert!(!spec.suspended);
    }

    #[test]
    fn consumer_name_defaults_from_metadata() {
        let spec: AgentSpec = serde_json::from_value(minimal_spec_json()).unwrap();
        let mut agent = Agent::new("sentinel", spec);
        assert_eq!(agent.consumer_name(), "agent-sentinel");

        agent.spec.bus.consumer_name = Some("custom-consumer".to_string());
        assert_eq!(agent.consumer_name(), "custom-consumer");
    }

    #[test]
    fn phase_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_value(AgentPhase::Provisioning).unwrap(),
            serde_json::json!("Provisioning")
        );
    }
}
