//! Pipeline reconciler: validates the step DAG, manages the cron schedule,
//! and drives execution by publishing step tasks to the bus and correlating
//! asynchronous results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::{dag, template};
use crate::bus::{step_result_filter, step_task_id, task_subject, TaskEnvelope};
use crate::controllers::types::{
    finalizer_error, now_rfc3339, parse_rfc3339, resolve_bus_addressing, status_merge_patch,
    Context, Error, Result,
};
use crate::crds::pipeline::{Pipeline, PipelinePhase, PipelineStatus, StepPhase};
use crate::crds::{set_condition, Agent, Condition};

pub const PIPELINE_FINALIZER: &str = "agents.platform/pipeline-finalizer";

/// Requeue interval while a run is in flight.
const RUNNING_REQUEUE: Duration = Duration::from_secs(5);

#[instrument(skip(ctx), fields(pipeline = %pipeline.name_any()))]
pub async fn reconcile(pipeline: Arc<Pipeline>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = pipeline.namespace().ok_or(Error::MissingObjectKey)?;
    let pipelines: Api<Pipeline> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&pipelines, PIPELINE_FINALIZER, pipeline, |event| async {
        match event {
            FinalizerEvent::Apply(pipeline) => apply(pipeline, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(pipeline) => cleanup(pipeline, &ctx, &namespace).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn cleanup(pipeline: Arc<Pipeline>, ctx: &Context, namespace: &str) -> Result<Action> {
    ctx.scheduler.remove(namespace, &pipeline.name_any());
    Ok(Action::await_change())
}

async fn apply(pipeline: Arc<Pipeline>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = pipeline.name_any();
    let generation = pipeline.metadata.generation;
    let mut status = pipeline.status.clone().unwrap_or_default();

    // Validation gate: nothing is dispatched for an invalid spec, and
    // failures wait for the user to correct it rather than retrying.
    if let Some((reason, message)) = validation_failure(&pipeline, ctx, namespace).await? {
        info!(pipeline = %name, reason = %reason, "Pipeline spec invalid");
        set_condition(
            &mut status.conditions,
            Condition::new("Valid", "False", &reason, &message, generation),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(&pipeline, ctx, namespace, &status).await?;
        return Ok(Action::await_change());
    }
    set_condition(
        &mut status.conditions,
        Condition::new("Valid", "True", "Valid", "Pipeline spec is valid", generation),
    );

    // Schedule management, keyed namespace/name.
    match (&pipeline.spec.schedule, pipeline.spec.suspended) {
        (Some(expression), false) => {
            if let Err(e) = ctx
                .scheduler
                .ensure(ctx.client.clone(), namespace, &name, expression)
            {
                set_condition(
                    &mut status.conditions,
                    Condition::new("Valid", "False", "InvalidSchedule", &e.to_string(), generation),
                );
                status.observed_generation = generation.unwrap_or_default();
                persist(&pipeline, ctx, namespace, &status).await?;
                return Ok(Action::await_change());
            }
        }
        _ => ctx.scheduler.remove(namespace, &name),
    }

    if pipeline.spec.suspended {
        status.phase = PipelinePhase::Suspended;
        status.observed_generation = generation.unwrap_or_default();
        persist(&pipeline, ctx, namespace, &status).await?;
        return Ok(Action::await_change());
    }

    // First sight: initialize step statuses and sit Idle until triggered.
    if status.step_statuses.is_empty() {
        status.phase = PipelinePhase::Idle;
        status.step_statuses = PipelineStatus::fresh_steps(&pipeline.spec);
        status.observed_generation = generation.unwrap_or_default();
        persist(&pipeline, ctx, namespace, &status).await?;
        return Ok(Action::await_change());
    }

    match status.phase {
        PipelinePhase::Running => run(&pipeline, ctx, namespace, status).await,
        PipelinePhase::Suspended => {
            // Spec no longer suspended: return to Idle so triggers work again.
            status.phase = PipelinePhase::Idle;
            status.observed_generation = generation.unwrap_or_default();
            persist(&pipeline, ctx, namespace, &status).await?;
            Ok(Action::await_change())
        }
        _ => {
            status.observed_generation = generation.unwrap_or_default();
            persist(&pipeline, ctx, namespace, &status).await?;
            Ok(Action::await_change())
        }
    }
}

/// Agent-reference and DAG validation. Returns the condition reason and
/// message of the first failure.
async fn validation_failure(
    pipeline: &Pipeline,
    ctx: &Context,
    namespace: &str,
) -> Result<Option<(String, String)>> {
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);
    for step in &pipeline.spec.steps {
        if agents.get_opt(&step.agent_ref).await?.is_none() {
            return Ok(Some((
                "InvalidAgentRef".to_string(),
                format!(
                    "step {:?} references non-existent agent {:?}",
                    step.name, step.agent_ref
                ),
            )));
        }
    }

    if let Err(e) = dag::validate(&pipeline.spec.steps) {
        return Ok(Some((e.reason().to_string(), e.to_string())));
    }

    Ok(None)
}

/// One execution pass over a running pipeline: reconcile running steps
/// against bus results, dispatch newly-ready steps, then check termination.
#[allow(clippy::too_many_lines)]
async fn run(
    pipeline: &Pipeline,
    ctx: &Context,
    namespace: &str,
    mut status: PipelineStatus,
) -> Result<Action> {
    let name = pipeline.name_any();
    let spec = &pipeline.spec;
    let generation = pipeline.metadata.generation;
    let now = Utc::now();

    // A manual Idle->Running trigger may arrive without a start time or
    // with leftovers from the previous run; normalize into a fresh run.
    if status.started_at.is_none() {
        status.started_at = Some(now.to_rfc3339());
        status.completed_at = None;
        if status.step_statuses.iter().all(|s| s.phase.is_terminal()) {
            status.step_statuses = PipelineStatus::fresh_steps(spec);
        }
    }

    // Overall timeout.
    if let Some(started) = status.started_at.as_deref().and_then(parse_rfc3339) {
        if (now - started).num_seconds() > i64::from(spec.timeout) {
            info!(pipeline = %name, "Pipeline timed out after {}s", spec.timeout);
            status.phase = PipelinePhase::Failed;
            status.completed_at = Some(now_rfc3339());
            status.runs_failed += 1;
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "Complete",
                    "True",
                    "Timeout",
                    &format!("Pipeline timed out after {}s", spec.timeout),
                    generation,
                ),
            );
            status.observed_generation = generation.unwrap_or_default();
            persist(pipeline, ctx, namespace, &status).await?;
            return Ok(Action::await_change());
        }
    }

    let addressing =
        resolve_bus_addressing(&ctx.client, namespace, spec.fleet_ref.as_deref()).await?;
    let spec_steps: HashMap<&str, &crate::crds::pipeline::PipelineStep> =
        spec.steps.iter().map(|s| (s.name.as_str(), s)).collect();

    // Running steps: per-step timeout, then a bounded result poll.
    for step_status in &mut status.step_statuses {
        if step_status.phase != StepPhase::Running {
            continue;
        }
        let Some(step_spec) = spec_steps.get(step_status.name.as_str()) else {
            continue;
        };

        if let Some(started) = step_status.started_at.as_deref().and_then(parse_rfc3339) {
            if (now - started).num_seconds() > i64::from(step_spec.timeout) {
                info!(pipeline = %name, step = %step_status.name, "Step timed out");
                step_status.phase = StepPhase::Failed;
                step_status.error = Some(format!("step timed out after {}s", step_spec.timeout));
                step_status.completed_at = Some(now_rfc3339());
                continue;
            }
        }

        let filter = step_result_filter(&addressing.prefix, &name, &step_status.name);
        let result = match ctx
            .bus
            .fetch_result(&addressing.results_stream, &filter)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(pipeline = %name, step = %step_status.name, "Result poll failed: {e}");
                continue;
            }
        };
        let Some(result) = result else { continue };

        step_status.completed_at = Some(now_rfc3339());
        if let Some(error) = result.error.filter(|e| !e.is_empty()) {
            step_status.phase = StepPhase::Failed;
            step_status.error = Some(error);
            let max_retries = spec.retry_policy.as_ref().map_or(0, |p| p.max_retries);
            if step_status.retries < max_retries {
                step_status.retries += 1;
                step_status.phase = StepPhase::Pending;
                step_status.error = None;
                // completedAt stays: it anchors the retry backoff window.
                info!(
                    pipeline = %name, step = %step_status.name,
                    "Retrying step (attempt {} of {})", step_status.retries, max_retries
                );
            }
        } else {
            step_status.phase = StepPhase::Succeeded;
            step_status.output = result.output;
        }
    }

    // Ready steps: dependencies settled, backoff elapsed -> render and publish.
    let snapshot = status.step_statuses.clone();
    let status_snapshot: HashMap<&str, &crate::crds::pipeline::StepStatus> =
        snapshot.iter().map(|s| (s.name.as_str(), s)).collect();

    for step in &spec.steps {
        let Some(index) = status
            .step_statuses
            .iter()
            .position(|s| s.name == step.name)
        else {
            continue;
        };
        if status.step_statuses[index].phase != StepPhase::Pending {
            continue;
        }

        if status.step_statuses[index].retries > 0 {
            if let (Some(policy), Some(completed)) = (
                spec.retry_policy.as_ref(),
                status.step_statuses[index]
                    .completed_at
                    .as_deref()
                    .and_then(parse_rfc3339),
            ) {
                let backoff = chrono::Duration::seconds(i64::from(policy.backoff_seconds));
                if completed + backoff > now {
                    continue;
                }
            }
        }

        if !dag::dependencies_satisfied(step, &status_snapshot, &spec_steps) {
            continue;
        }

        let task = match template::render_task(spec, &snapshot, &step.task) {
            Ok(task) => task,
            Err(e) => {
                warn!(pipeline = %name, step = %step.name, "Template render failed: {e}");
                status.step_statuses[index].phase = StepPhase::Failed;
                status.step_statuses[index].error = Some(e.to_string());
                status.step_statuses[index].completed_at = Some(now_rfc3339());
                continue;
            }
        };

        // The referenced agent supplies the routing domain.
        let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);
        let agent = match agents.get_opt(&step.agent_ref).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                warn!(pipeline = %name, step = %step.name, "Agent {} vanished", step.agent_ref);
                continue;
            }
            Err(e) => {
                warn!(pipeline = %name, step = %step.name, "Agent fetch failed: {e}");
                continue;
            }
        };

        let task_id = step_task_id(&name, &step.name, Utc::now().timestamp_millis());
        let envelope = TaskEnvelope {
            task_id: task_id.clone(),
            pipeline_name: Some(name.clone()),
            step_name: Some(step.name.clone()),
            task,
        };
        let subject = task_subject(&addressing.prefix, &agent.spec.domain, &step.agent_ref);
        if let Err(e) = ctx.bus.publish(subject, &envelope).await {
            warn!(pipeline = %name, step = %step.name, "Task publish failed: {e}");
            continue;
        }

        info!(pipeline = %name, step = %step.name, task_id = %task_id, agent = %step.agent_ref, "Dispatched step");
        status.step_statuses[index].phase = StepPhase::Running;
        status.step_statuses[index].started_at = Some(now_rfc3339());
        status.step_statuses[index].completed_at = None;
        status.step_statuses[index].error = None;
    }

    // Termination: all steps terminal, or a hard failure with only
    // pending work left to skip.
    let any_hard_failure = status.step_statuses.iter().any(|s| {
        s.phase == StepPhase::Failed
            && !spec_steps
                .get(s.name.as_str())
                .is_some_and(|step| step.continue_on_failure)
    });

    if any_hard_failure {
        for step_status in &mut status.step_statuses {
            if step_status.phase == StepPhase::Pending {
                step_status.phase = StepPhase::Skipped;
            }
        }
    }

    let all_terminal = status
        .step_statuses
        .iter()
        .all(|s| s.phase.is_terminal());

    if all_terminal {
        status.completed_at = Some(now_rfc3339());
        if any_hard_failure {
            status.phase = PipelinePhase::Failed;
            status.runs_failed += 1;
            set_condition(
                &mut status.conditions,
                Condition::new("Complete", "True", "Failed", "One or more steps failed", generation),
            );
        } else {
            status.phase = PipelinePhase::Succeeded;
            status.runs_completed += 1;
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "Complete",
                    "True",
                    "Succeeded",
                    "All steps completed successfully",
                    generation,
                ),
            );
        }
        status.observed_generation = generation.unwrap_or_default();
        persist(pipeline, ctx, namespace, &status).await?;
        debug!(pipeline = %name, phase = ?status.phase, "Run finished");
        return Ok(Action::await_change());
    }

    set_condition(
        &mut status.conditions,
        Condition::new("Complete", "False", "Running", "Pipeline run in progress", generation),
    );
    status.observed_generation = generation.unwrap_or_default();
    persist(pipeline, ctx, namespace, &status).await?;
    Ok(Action::requeue(RUNNING_REQUEUE))
}

async fn persist(
    pipeline: &Pipeline,
    ctx: &Context,
    namespace: &str,
    status: &PipelineStatus,
) -> Result<()> {
    let pipelines: Api<Pipeline> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = status_merge_patch(status, &["completedAt"])?;
    pipelines
        .patch_status(
            &pipeline.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}
