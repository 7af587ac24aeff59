//! Process-wide cron registry for scheduled Pipeline runs.
//!
//! One tokio ticker task per registered schedule, indexed by
//! `namespace/name`. A trigger re-reads the Pipeline and flips it to
//! Running with freshly initialized step statuses. Missed fires during
//! operator downtime are not replayed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use cron::Schedule;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controllers::types::{now_rfc3339, status_merge_patch, Error, Result};
use crate::crds::pipeline::{Pipeline, PipelinePhase, PipelineStatus};

struct Entry {
    expression: String,
    handle: JoinHandle<()>,
}

/// Mutex-guarded map of active cron entries.
#[derive(Default)]
pub struct CronScheduler {
    entries: Mutex<HashMap<String, Entry>>,
}

/// The `cron` crate wants a seconds column; standard 5-field expressions
/// are pinned to second zero.
fn normalize_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Validate a cron expression without registering it.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_expression(expression)).map_err(|e| Error::Cron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

impl CronScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register after an edit) the schedule for one
    /// pipeline. A no-op when the same expression is already active.
    pub fn ensure(
        &self,
        client: Client,
        namespace: &str,
        name: &str,
        expression: &str,
    ) -> Result<()> {
        let key = format!("{namespace}/{name}");
        let schedule = parse_schedule(expression)?;

        let mut entries = self.entries.lock().expect("cron registry poisoned");
        if let Some(entry) = entries.get(&key) {
            if entry.expression == expression {
                return Ok(());
            }
            entry.handle.abort();
            entries.remove(&key);
        }

        info!(pipeline = %key, schedule = %expression, "Registering cron schedule");
        let namespace = namespace.to_string();
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(pipeline = %format!("{namespace}/{name}"), "Schedule has no future fires");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                trigger_run(&client, &namespace, &name).await;
            }
        });
        entries.insert(key, Entry {
            expression: expression.to_string(),
            handle,
        });
        Ok(())
    }

    /// Drop the entry for one pipeline, stopping its ticker.
    pub fn remove(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        let mut entries = self.entries.lock().expect("cron registry poisoned");
        if let Some(entry) = entries.remove(&key) {
            entry.handle.abort();
            debug!(pipeline = %key, "Removed cron schedule");
        }
    }

    #[must_use]
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        let key = format!("{namespace}/{name}");
        self.entries
            .lock()
            .expect("cron registry poisoned")
            .contains_key(&key)
    }
}

/// Start a fresh run for a scheduled pipeline: re-read it, reset step
/// statuses, and flip the phase to Running.
async fn trigger_run(client: &Client, namespace: &str, name: &str) {
    let pipelines: Api<Pipeline> = Api::namespaced(client.clone(), namespace);

    let pipeline = match pipelines.get(name).await {
        Ok(p) => p,
        Err(e) => {
            error!(pipeline = %format!("{namespace}/{name}"), "Cron trigger fetch failed: {e}");
            return;
        }
    };

    if pipeline.spec.suspended {
        debug!(pipeline = %format!("{namespace}/{name}"), "Suspended, skipping cron trigger");
        return;
    }

    let previous = pipeline.status.unwrap_or_default();
    let now = now_rfc3339();
    let status = PipelineStatus {
        phase: PipelinePhase::Running,
        step_statuses: PipelineStatus::fresh_steps(&pipeline.spec),
        started_at: Some(now.clone()),
        completed_at: None,
        last_scheduled_at: Some(now),
        ..previous
    };

    let patch = match status_merge_patch(&status, &["completedAt"]) {
        Ok(p) => p,
        Err(e) => {
            error!("Cron trigger patch build failed: {e}");
            return;
        }
    };

    match pipelines
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => info!(pipeline = %format!("{namespace}/{name}"), "Cron trigger started run"),
        Err(e) => error!(pipeline = %format!("{namespace}/{name}"), "Cron trigger status update failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_are_normalized() {
        assert_eq!(normalize_expression("0 */6 * * *"), "0 0 */6 * * *");
        assert_eq!(normalize_expression("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[test]
    fn parse_schedule_accepts_standard_cron() {
        assert!(parse_schedule("0 */6 * * *").is_ok());
        assert!(parse_schedule("30 4 * * 1-5").is_ok());
    }

    #[test]
    fn parse_schedule_rejects_garbage() {
        let err = parse_schedule("every six hours").unwrap_err();
        assert!(matches!(err, Error::Cron { .. }));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let scheduler = CronScheduler::new();
        scheduler.remove("default", "absent");
        assert!(!scheduler.contains("default", "absent"));
    }
}
