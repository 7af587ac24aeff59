//! Shared context and error types for the reconcilers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::finalizer;
use kube::{Api, Client};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::bus::{Bus, DEFAULT_SUBJECT_PREFIX};
use crate::crds::Fleet;
use crate::scheduler::CronScheduler;

/// Errors surfaced by the reconcilers. Everything flows into status
/// conditions and requeues; nothing here crashes the process.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Template render error: {0}")]
    Template(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    Cron { expression: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource is missing a name or namespace")]
    MissingObjectKey,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconcile invocation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub bus: Arc<Bus>,
    pub scheduler: Arc<CronScheduler>,
}

/// Flatten the finalizer wrapper error into our error type.
pub fn finalizer_error(err: finalizer::Error<Error>) -> Error {
    match err {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => Error::Kube(e),
        finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        finalizer::Error::InvalidFinalizer => {
            Error::Config("invalid finalizer name".to_string())
        }
    }
}

/// Current time as the RFC3339 string stored in status blocks.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a status timestamp back into a `DateTime<Utc>`.
#[must_use]
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Merge patch for a status subresource. Fields listed in `clearable` are
/// forced to explicit nulls when absent so a merge patch actually clears
/// them server-side.
pub fn status_merge_patch<S: Serialize>(status: &S, clearable: &[&str]) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(map) = value.as_object_mut() {
        for key in clearable {
            map.entry((*key).to_string()).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": value }))
}

/// Resolved bus addressing for a pipeline or mission: the subject prefix
/// and the results stream to poll.
pub struct BusAddressing {
    pub prefix: String,
    pub results_stream: String,
}

impl Default for BusAddressing {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            results_stream: crate::bus::stream_name(DEFAULT_SUBJECT_PREFIX, "results"),
        }
    }
}

/// Resolve the subject prefix and results stream through an optional Fleet
/// reference. A missing or unnamed fleet falls back to the defaults.
pub async fn resolve_bus_addressing(
    client: &Client,
    namespace: &str,
    fleet_ref: Option<&str>,
) -> Result<BusAddressing> {
    let Some(fleet_name) = fleet_ref else {
        return Ok(BusAddressing::default());
    };

    let fleets: Api<Fleet> = Api::namespaced(client.clone(), namespace);
    match fleets.get_opt(fleet_name).await? {
        Some(fleet) => Ok(BusAddressing {
            prefix: fleet.spec.bus.subject_prefix.clone(),
            results_stream: fleet.spec.bus.results_stream.clone(),
        }),
        None => Ok(BusAddressing::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::pipeline::PipelineStatus;

    #[test]
    fn status_merge_patch_inserts_explicit_nulls() {
        let status = PipelineStatus::default();
        let patch = status_merge_patch(&status, &["completedAt"]).unwrap();
        assert!(patch["status"]["completedAt"].is_null());
        assert_eq!(patch["status"]["phase"], "Idle");
    }

    #[test]
    fn status_merge_patch_keeps_set_values() {
        let status = PipelineStatus {
            completed_at: Some("2026-01-01T00:00:00+00:00".to_string()),
            ..PipelineStatus::default()
        };
        let patch = status_merge_patch(&status, &["completedAt"]).unwrap();
        assert_eq!(patch["status"]["completedAt"], "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn rfc3339_roundtrip() {
        let now = now_rfc3339();
        assert!(parse_rfc3339(&now).is_some());
        assert!(parse_rfc3339("not-a-timestamp").is_none());
    }

    #[test]
    fn default_addressing_uses_shared_prefix() {
        let addressing = BusAddressing::default();
        assert_eq!(addressing.prefix, "fleet-a");
        assert_eq!(addressing.results_stream, "fleet_a_results");
    }
}
