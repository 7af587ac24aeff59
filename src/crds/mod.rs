//! Custom resource definitions for the fleet operator.
//!
//! Four kinds live in the `agents.platform/v1alpha1` group: [`Agent`],
//! [`Pipeline`], [`Mission`] and [`Fleet`]. Status blocks share the
//! [`Condition`] type and all carry `observedGeneration`.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod agent;
pub mod fleet;
pub mod mission;
pub mod pipeline;

pub use agent::{Agent, AgentPhase, AgentSpec, AgentStatus};
pub use fleet::{Fleet, FleetPhase, FleetSpec, FleetStatus};
pub use mission::{Mission, MissionPhase, MissionSpec, MissionStatus};
pub use pipeline::{Pipeline, PipelinePhase, PipelineSpec, PipelineStatus, StepPhase};

/// Structured status signal shared by all four kinds.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (unique per resource), e.g. "Available", "Valid".
    #[serde(rename = "type")]
    pub condition_type: String,

    /// One of "True", "False", "Unknown".
    pub status: String,

    /// Machine-readable reason for the last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Spec generation the condition was computed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC3339 timestamp of the last status flip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn new(
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            observed_generation: generation,
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// Upsert a condition keyed by type. The transition time is preserved when
/// the status value did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        let transition_time = if existing.status == condition.status {
            existing.last_transition_time.clone()
        } else {
            condition.last_transition_time.clone()
        };
        *existing = condition;
        existing.last_transition_time = transition_time;
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_inserts_new_types() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Available", "True", "Ready", "all good", Some(1)),
        );
        set_condition(
            &mut conditions,
            Condition::new("Valid", "True", "Valid", "spec ok", Some(1)),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn set_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Available", "True", "Ready", "all good", Some(1)),
        );
        set_condition(
            &mut conditions,
            Condition::new("Available", "False", "Degraded", "1/2 ready", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].reason.as_deref(), Some("Degraded"));
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        let mut first = Condition::new("Available", "True", "Ready", "all good", Some(1));
        first.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_string());
        set_condition(&mut conditions, first);
        set_condition(
            &mut conditions,
            Condition::new("Available", "True", "Ready", "still good", Some(2)),
        );
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still good"));
    }

    #[test]
    fn set_condition_bumps_transition_time_on_flip() {
        let mut conditions = Vec::new();
        let mut first = Condition::new("Available", "True", "Ready", "all good", Some(1));
        first.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_string());
        set_condition(&mut conditions, first);
        set_condition(
            &mut conditions,
            Condition::new("Available", "False", "Suspended", "suspended", Some(2)),
        );
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00+00:00")
        );
    }
}
