//! NATS JetStream plumbing shared by the controllers.
//!
//! One lazily-created, auto-reconnecting JetStream context per process,
//! guarded by a mutex during setup only. Result pickup is a bounded
//! ephemeral pull-consumer fetch so a slow step never starves a reconcile.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::controllers::types::{Error, Result};

/// Subject prefix used when no Fleet is referenced.
pub const DEFAULT_SUBJECT_PREFIX: &str = "fleet-a";

/// Upper bound on a single result poll.
const RESULT_POLL_WINDOW: Duration = Duration::from_millis(500);

/// Task envelope published to an agent's task subject.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub task_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    pub task: String,
}

/// Result envelope consumed from a pipeline step's result subject.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Briefing envelope published when a mission enters its Briefing phase.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BriefingEnvelope {
    pub mission_name: String,
    pub objective: String,
    pub briefing: String,
    pub agents: Vec<String>,
}

/// Task subject for one agent: `<prefix>.tasks.<domain>.<agent>`.
#[must_use]
pub fn task_subject(prefix: &str, domain: &str, agent: &str) -> String {
    format!("{prefix}.tasks.{domain}.{agent}")
}

/// Wildcard filter for one pipeline step's results; the trailing component
/// is the task id.
#[must_use]
pub fn step_result_filter(prefix: &str, pipeline: &str, step: &str) -> String {
    format!("{prefix}.results.pipeline-{pipeline}-{step}.*")
}

/// Briefing subject for a mission prefix.
#[must_use]
pub fn briefing_subject(prefix: &str) -> String {
    format!("{prefix}.briefing")
}

/// Stream name derived from a subject prefix (`fleet-a` -> `fleet_a_tasks`).
#[must_use]
pub fn stream_name(prefix: &str, suffix: &str) -> String {
    format!("{}_{suffix}", prefix.replace('-', "_"))
}

/// Task id for one pipeline step dispatch.
#[must_use]
pub fn step_task_id(pipeline: &str, step: &str, millis: i64) -> String {
    format!("pipeline-{pipeline}-{step}-{millis}")
}

/// Lazily-connected JetStream handle, shared across controllers.
pub struct Bus {
    url: String,
    context: Mutex<Option<jetstream::Context>>,
}

impl Bus {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url,
            context: Mutex::new(None),
        }
    }

    /// Connect on first use; afterwards the client reconnects on its own
    /// with a 2 s delay and unlimited attempts.
    async fn context(&self) -> Result<jetstream::Context> {
        let mut guard = self.context.lock().await;
        if let Some(js) = guard.as_ref() {
            return Ok(js.clone());
        }

        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|_attempts| Duration::from_secs(2))
            .connect(&self.url)
            .await
            .map_err(|e| Error::Bus(format!("connect to {} failed: {e}", self.url)))?;

        info!(url = %self.url, "Connected to NATS");
        let js = jetstream::new(client);
        *guard = Some(js.clone());
        Ok(js)
    }

    /// Publish a JSON payload and wait for the JetStream ack.
    pub async fn publish<T: Serialize>(&self, subject: String, payload: &T) -> Result<()> {
        let js = self.context().await?;
        let data = serde_json::to_vec(payload)?;
        js.publish(subject.clone(), data.into())
            .await
            .map_err(|e| Error::Bus(format!("publish to {subject} failed: {e}")))?
            .await
            .map_err(|e| Error::Bus(format!("publish ack for {subject} failed: {e}")))?;
        debug!(subject = %subject, "Published message");
        Ok(())
    }

    /// Nonblocking-ish result pickup: fetch at most one message matching
    /// `filter` from `stream_name`, waiting no longer than the poll window.
    pub async fn fetch_result(
        &self,
        stream_name: &str,
        filter: &str,
    ) -> Result<Option<TaskResult>> {
        let js = self.context().await?;
        let stream = js
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::Bus(format!("stream {stream_name} lookup failed: {e}")))?;

        let consumer = stream
            .create_consumer(pull::Config {
                filter_subject: filter.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Bus(format!("consumer on {filter} failed: {e}")))?;

        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(RESULT_POLL_WINDOW)
            .messages()
            .await
            .map_err(|e| Error::Bus(format!("fetch on {filter} failed: {e}")))?;

        if let Some(message) = batch.next().await {
            let message = message.map_err(|e| Error::Bus(format!("read on {filter}: {e}")))?;
            message
                .ack()
                .await
                .map_err(|e| Error::Bus(format!("ack on {filter}: {e}")))?;
            let result: TaskResult = serde_json::from_slice(&message.payload)?;
            return Ok(Some(result));
        }

        Ok(None)
    }

    /// Create a stream if absent; an existing stream of the same name is
    /// left untouched. Returns whether the stream was created.
    pub async fn ensure_stream(&self, config: stream::Config) -> Result<bool> {
        let js = self.context().await?;
        let name = config.name.clone();
        if js.get_stream(name.as_str()).await.is_ok() {
            return Ok(false);
        }
        js.create_stream(config)
            .await
            .map_err(|e| Error::Bus(format!("create stream {name} failed: {e}")))?;
        info!(stream = %name, "Created JetStream stream");
        Ok(true)
    }

    /// Delete a durable consumer, tolerating a missing stream or consumer.
    pub async fn delete_consumer(&self, stream_name: &str, consumer: &str) -> Result<()> {
        let js = self.context().await?;
        let Ok(stream) = js.get_stream(stream_name).await else {
            debug!(stream = %stream_name, "Stream absent, nothing to tear down");
            return Ok(());
        };
        match stream.delete_consumer(consumer).await {
            Ok(_) => {
                info!(stream = %stream_name, consumer = %consumer, "Deleted durable consumer");
                Ok(())
            }
            Err(e) => {
                debug!(consumer = %consumer, "Consumer delete skipped: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_naming() {
        assert_eq!(
            task_subject("fleet-a", "security", "sentinel"),
            "fleet-a.tasks.security.sentinel"
        );
        assert_eq!(
            step_result_filter("fleet-a", "recon", "scan"),
            "fleet-a.results.pipeline-recon-scan.*"
        );
        assert_eq!(briefing_subject("mission-red-team"), "mission-red-team.briefing");
    }

    #[test]
    fn stream_names_replace_dashes() {
        assert_eq!(stream_name("fleet-a", "tasks"), "fleet_a_tasks");
        assert_eq!(stream_name("fleet-a", "results"), "fleet_a_results");
        assert_eq!(stream_name("blue", "heartbeat"), "blue_heartbeat");
    }

    #[test]
    fn task_envelope_wire_format() {
        let envelope = TaskEnvelope {
            task_id: step_task_id("recon", "scan", 1_700_000_000_000),
            pipeline_name: Some("recon".to_string()),
            step_name: Some("scan".to_string()),
            task: "scan the network".to_string(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "taskId": "pipeline-recon-scan-1700000000000",
                "pipelineName": "recon",
                "stepName": "scan",
                "task": "scan the network"
            })
        );
    }

    #[test]
    fn result_envelope_accepts_error_or_output() {
        let ok: TaskResult =
            serde_json::from_str(r#"{"taskId":"t1","output":"all clear"}"#).unwrap();
        assert_eq!(ok.output.as_deref(), Some("all clear"));
        assert!(ok.error.is_none());

        let failed: TaskResult = serde_json::from_str(r#"{"taskId":"t2","error":"boom"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
