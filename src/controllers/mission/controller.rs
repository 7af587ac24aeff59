//! Mission reconciler: drives an ephemeral multi-agent engagement through
//! its phase machine with TTL-enforced cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::bus::{briefing_subject, task_subject, BriefingEnvelope, TaskEnvelope};
use crate::controllers::types::{
    finalizer_error, now_rfc3339, parse_rfc3339, resolve_bus_addressing, status_merge_patch,
    Context, Error, Result,
};
use crate::crds::mission::{
    CleanupPolicy, Mission, MissionAgentStatus, MissionPhase, MissionPipelinePhase, MissionStatus,
};
use crate::crds::pipeline::{Pipeline, PipelinePhase, PipelineStatus};
use crate::crds::{set_condition, Agent, AgentPhase, Condition};

pub const MISSION_FINALIZER: &str = "agents.platform/mission-finalizer";

const PHASE_TICK: Duration = Duration::from_secs(5);

#[instrument(skip(ctx), fields(mission = %mission.name_any()))]
pub async fn reconcile(mission: Arc<Mission>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = mission.namespace().ok_or(Error::MissingObjectKey)?;
    let missions: Api<Mission> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&missions, MISSION_FINALIZER, mission, |event| async {
        match event {
            FinalizerEvent::Apply(mission) => apply(mission, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(mission) => {
                debug!(mission = %mission.name_any(), "Mission deleted");
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn apply(mission: Arc<Mission>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = mission.name_any();
    let generation = mission.metadata.generation;

    // Status init: stamp the start and TTL deadline, record the roster.
    let Some(mut status) = mission.status.clone().filter(|s| s.started_at.is_some()) else {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(i64::from(mission.spec.ttl));
        let status = MissionStatus {
            phase: MissionPhase::Assembling,
            started_at: Some(now.to_rfc3339()),
            expires_at: Some(expires.to_rfc3339()),
            agent_statuses: mission
                .spec
                .agents
                .iter()
                .map(|a| MissionAgentStatus {
                    name: a.name.clone(),
                    ephemeral: a.ephemeral,
                    ..MissionAgentStatus::default()
                })
                .collect(),
            observed_generation: generation.unwrap_or_default(),
            ..MissionStatus::default()
        };
        persist(&mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    // TTL gate applies to every non-cleanup phase.
    let expired = status
        .expires_at
        .as_deref()
        .and_then(parse_rfc3339)
        .is_some_and(|deadline| Utc::now() > deadline);
    if expired
        && !matches!(
            status.phase,
            MissionPhase::CleaningUp | MissionPhase::Expired
        )
    {
        info!(mission = %name, "Mission TTL expired");
        status.phase = MissionPhase::Expired;
        status.completed_at = Some(now_rfc3339());
        status.result = Some("Mission expired (TTL exceeded)".to_string());
        set_condition(
            &mut status.conditions,
            Condition::new("Complete", "True", "Expired", "Mission TTL expired", generation),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(&mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(PHASE_TICK));
    }

    match status.phase {
        MissionPhase::Assembling => assemble(&mission, ctx, namespace, status).await,
        MissionPhase::Briefing => brief(&mission, ctx, namespace, status).await,
        MissionPhase::Active => active(&mission, ctx, namespace, status).await,
        MissionPhase::Succeeded | MissionPhase::Failed | MissionPhase::Expired => {
            status.phase = MissionPhase::CleaningUp;
            status.observed_generation = generation.unwrap_or_default();
            persist(&mission, ctx, namespace, &status).await?;
            Ok(Action::requeue(PHASE_TICK))
        }
        MissionPhase::CleaningUp => cleaning_up(&mission, ctx, namespace, status).await,
    }
}

/// Assembling: wait for every referenced (non-ephemeral) agent to be Ready.
/// Ephemeral agents are noted and skipped; they never gate readiness.
async fn assemble(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    mut status: MissionStatus,
) -> Result<Action> {
    let name = mission.name_any();
    let generation = mission.metadata.generation;
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);

    let mut all_ready = true;
    let mut has_persistent = false;

    for (index, member) in mission.spec.agents.iter().enumerate() {
        if member.ephemeral {
            debug!(mission = %name, agent = %member.name, "Ephemeral agent noted, not provisioned");
            if let Some(entry) = status.agent_statuses.get_mut(index) {
                entry.ready = false;
            }
            continue;
        }
        has_persistent = true;

        let Some(agent) = agents.get_opt(&member.name).await? else {
            warn!(mission = %name, agent = %member.name, "Referenced agent not found");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "AgentsReady",
                    "False",
                    "AgentNotFound",
                    &format!("Agent {:?} not found", member.name),
                    generation,
                ),
            );
            status.observed_generation = generation.unwrap_or_default();
            persist(mission, ctx, namespace, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        };

        let ready = agent
            .status
            .as_ref()
            .is_some_and(|s| s.phase == AgentPhase::Ready && s.ready);
        if let Some(entry) = status.agent_statuses.get_mut(index) {
            entry.ready = ready;
        }
        if !ready {
            all_ready = false;
            debug!(mission = %name, agent = %member.name, "Agent not ready yet");
        }
    }

    if !has_persistent {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "AgentsReady",
                "False",
                "NoValidAgents",
                "All mission agents are ephemeral (not provisioned in this version)",
                generation,
            ),
        );
        status.phase = MissionPhase::Failed;
        status.completed_at = Some(now_rfc3339());
        status.result = Some("No valid agents available".to_string());
        status.observed_generation = generation.unwrap_or_default();
        persist(mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(PHASE_TICK));
    }

    if all_ready {
        info!(mission = %name, "All agents assembled, moving to Briefing");
        set_condition(
            &mut status.conditions,
            Condition::new(
                "AgentsReady",
                "True",
                "AllAgentsReady",
                "All referenced agents are ready",
                generation,
            ),
        );
        status.phase = MissionPhase::Briefing;
        status.observed_generation = generation.unwrap_or_default();
        persist(mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    status.observed_generation = generation.unwrap_or_default();
    persist(mission, ctx, namespace, &status).await?;
    Ok(Action::requeue(PHASE_TICK))
}

/// Briefing: publish the mission context, then go Active. Publish failures
/// hold the phase and retry.
async fn brief(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    mut status: MissionStatus,
) -> Result<Action> {
    let name = mission.name_any();
    let generation = mission.metadata.generation;

    if mission
        .spec
        .briefing
        .as_deref()
        .is_some_and(|b| !b.is_empty())
    {
        if let Err(e) = publish_briefing(mission, ctx, namespace).await {
            warn!(mission = %name, "Briefing publish failed, will retry: {e}");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "BriefingPublished",
                    "False",
                    "PublishFailed",
                    &format!("Failed to publish briefing: {e}"),
                    generation,
                ),
            );
            status.observed_generation = generation.unwrap_or_default();
            persist(mission, ctx, namespace, &status).await?;
            return Ok(Action::requeue(PHASE_TICK));
        }

        info!(mission = %name, "Briefing published");
        set_condition(
            &mut status.conditions,
            Condition::new(
                "BriefingPublished",
                "True",
                "Published",
                "Mission briefing published to all agents",
                generation,
            ),
        );
    } else {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "BriefingPublished",
                "True",
                "NoBriefing",
                "No briefing text configured",
                generation,
            ),
        );
    }

    status.phase = MissionPhase::Active;
    status.observed_generation = generation.unwrap_or_default();
    persist(mission, ctx, namespace, &status).await?;
    Ok(Action::requeue(Duration::from_secs(1)))
}

/// Publish the briefing envelope on the mission channel, then hand each
/// persistent agent the briefing as a regular task on the fleet prefix.
async fn publish_briefing(mission: &Mission, ctx: &Context, namespace: &str) -> Result<()> {
    let name = mission.name_any();
    let briefing = mission.spec.briefing.clone().unwrap_or_default();
    let agent_names: Vec<String> = mission.spec.agents.iter().map(|a| a.name.clone()).collect();

    let envelope = BriefingEnvelope {
        mission_name: name.clone(),
        objective: mission.spec.objective.clone(),
        briefing: briefing.clone(),
        agents: agent_names,
    };
    ctx.bus
        .publish(briefing_subject(&mission.bus_prefix()), &envelope)
        .await?;

    let addressing =
        resolve_bus_addressing(&ctx.client, namespace, mission.spec.fleet_ref.as_deref()).await?;
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);

    for member in &mission.spec.agents {
        if member.ephemeral {
            continue;
        }
        let Some(agent) = agents.get_opt(&member.name).await? else {
            continue;
        };

        let task = TaskEnvelope {
            task_id: format!(
                "mission-{name}-briefing-{}",
                Utc::now().timestamp_millis()
            ),
            pipeline_name: Some(format!("mission-{name}")),
            step_name: Some("briefing".to_string()),
            task: format!(
                "[Mission: {name}]\nObjective: {}\n\n{briefing}",
                mission.spec.objective
            ),
        };
        let subject = task_subject(&addressing.prefix, &agent.spec.domain, &member.name);
        if let Err(e) = ctx.bus.publish(subject, &task).await {
            warn!(mission = %name, agent = %member.name, "Briefing task publish failed: {e}");
        }
    }

    Ok(())
}

/// Active: watch Setup/Active pipelines, enforce the mission timeout, and
/// refresh agent summaries.
async fn active(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    mut status: MissionStatus,
) -> Result<Action> {
    let name = mission.name_any();
    let generation = mission.metadata.generation;
    let now = Utc::now();

    if let Some(started) = status.started_at.as_deref().and_then(parse_rfc3339) {
        if (now - started).num_seconds() > i64::from(mission.spec.timeout) {
            info!(mission = %name, "Mission timed out after {}s", mission.spec.timeout);
            let message = format!("Mission timed out after {}s", mission.spec.timeout);
            status.phase = MissionPhase::Failed;
            status.completed_at = Some(now_rfc3339());
            status.result = Some(message.clone());
            set_condition(
                &mut status.conditions,
                Condition::new("Complete", "True", "Timeout", &message, generation),
            );
            status.observed_generation = generation.unwrap_or_default();
            persist(mission, ctx, namespace, &status).await?;
            return Ok(Action::requeue(PHASE_TICK));
        }
    }

    let watched: Vec<_> = mission
        .spec
        .pipelines
        .iter()
        .filter(|p| {
            matches!(
                p.phase,
                MissionPipelinePhase::Setup | MissionPipelinePhase::Active
            )
        })
        .collect();

    if watched.is_empty() {
        status.phase = MissionPhase::Succeeded;
        status.completed_at = Some(now_rfc3339());
        status.result = Some("Mission completed (briefing-only)".to_string());
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Complete",
                "True",
                "Succeeded",
                "Briefing-only mission completed",
                generation,
            ),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(PHASE_TICK));
    }

    let pipelines: Api<Pipeline> = Api::namespaced(ctx.client.clone(), namespace);
    let mut all_complete = true;
    let mut any_failed = false;

    for reference in watched {
        match pipelines.get_opt(&reference.name).await? {
            None => {
                warn!(mission = %name, pipeline = %reference.name, "Referenced pipeline not found");
                any_failed = true;
            }
            Some(pipeline) => match pipeline.status.map(|s| s.phase).unwrap_or_default() {
                PipelinePhase::Succeeded => {}
                PipelinePhase::Failed => any_failed = true,
                _ => all_complete = false,
            },
        }
    }

    if any_failed {
        status.phase = MissionPhase::Failed;
        status.completed_at = Some(now_rfc3339());
        status.result = Some("One or more mission pipelines failed".to_string());
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Complete",
                "True",
                "PipelineFailed",
                "One or more mission pipelines failed",
                generation,
            ),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(PHASE_TICK));
    }

    if all_complete {
        status.phase = MissionPhase::Succeeded;
        status.completed_at = Some(now_rfc3339());
        status.result = Some("All mission pipelines completed successfully".to_string());
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Complete",
                "True",
                "Succeeded",
                "All mission pipelines completed successfully",
                generation,
            ),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(mission, ctx, namespace, &status).await?;
        return Ok(Action::requeue(PHASE_TICK));
    }

    refresh_agent_statuses(mission, ctx, namespace, &mut status).await;
    status.observed_generation = generation.unwrap_or_default();
    persist(mission, ctx, namespace, &status).await?;
    Ok(Action::requeue(PHASE_TICK))
}

/// CleaningUp: launch idle Teardown pipelines, wait for them, then either
/// self-delete (Delete policy, TTL reached) or settle.
async fn cleaning_up(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    mut status: MissionStatus,
) -> Result<Action> {
    let name = mission.name_any();
    let generation = mission.metadata.generation;
    let pipelines: Api<Pipeline> = Api::namespaced(ctx.client.clone(), namespace);

    for reference in &mission.spec.pipelines {
        if reference.phase != MissionPipelinePhase::Teardown {
            continue;
        }
        let Some(pipeline) = pipelines.get_opt(&reference.name).await? else {
            debug!(mission = %name, pipeline = %reference.name, "Teardown pipeline not found, skipping");
            continue;
        };
        match pipeline.status.as_ref().map(|s| s.phase.clone()).unwrap_or_default() {
            PipelinePhase::Idle => {
                info!(mission = %name, pipeline = %reference.name, "Triggering teardown pipeline");
                if let Err(e) = trigger_pipeline(&pipelines, &pipeline).await {
                    warn!(mission = %name, pipeline = %reference.name, "Teardown trigger failed: {e}");
                }
                return Ok(Action::requeue(PHASE_TICK));
            }
            PipelinePhase::Running => return Ok(Action::requeue(PHASE_TICK)),
            _ => {}
        }
    }

    let deadline = status.expires_at.as_deref().and_then(parse_rfc3339);
    let ttl_reached = deadline.is_some_and(|d| Utc::now() > d);

    if mission.spec.cleanup_policy == CleanupPolicy::Delete && ttl_reached {
        info!(mission = %name, "Deleting expired mission");
        let missions: Api<Mission> = Api::namespaced(ctx.client.clone(), namespace);
        missions.delete(&name, &DeleteParams::default()).await?;
        return Ok(Action::await_change());
    }

    set_condition(
        &mut status.conditions,
        Condition::new(
            "CleanupComplete",
            "True",
            "CleanedUp",
            "Mission cleanup completed",
            generation,
        ),
    );
    status.observed_generation = generation.unwrap_or_default();
    persist(mission, ctx, namespace, &status).await?;

    if mission.spec.cleanup_policy == CleanupPolicy::Delete {
        if let Some(deadline) = deadline {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            if !remaining.is_zero() {
                return Ok(Action::requeue(remaining));
            }
        }
    }

    Ok(Action::await_change())
}

/// Flip an Idle pipeline to Running with fresh step statuses.
async fn trigger_pipeline(api: &Api<Pipeline>, pipeline: &Pipeline) -> Result<()> {
    let previous = pipeline.status.clone().unwrap_or_default();
    let fresh = PipelineStatus {
        phase: PipelinePhase::Running,
        step_statuses: PipelineStatus::fresh_steps(&pipeline.spec),
        started_at: Some(now_rfc3339()),
        completed_at: None,
        ..previous
    };
    let patch = status_merge_patch(&fresh, &["completedAt"])?;
    api.patch_status(
        &pipeline.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Refresh readiness and cost rollup from the current Agent resources.
async fn refresh_agent_statuses(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    status: &mut MissionStatus,
) {
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);
    let mut total_cost = 0f64;

    for (index, member) in mission.spec.agents.iter().enumerate() {
        if member.ephemeral {
            continue;
        }
        match agents.get_opt(&member.name).await {
            Ok(Some(agent)) => {
                let agent_status = agent.status.unwrap_or_default();
                if let Some(entry) = status.agent_statuses.get_mut(index) {
                    entry.ready = agent_status.ready;
                }
                if let Some(cost) = agent_status
                    .total_cost
                    .as_deref()
                    .and_then(|c| c.parse::<f64>().ok())
                {
                    total_cost += cost;
                }
            }
            Ok(None) | Err(_) => {
                if let Some(entry) = status.agent_statuses.get_mut(index) {
                    entry.ready = false;
                }
            }
        }
    }

    status.total_cost = Some(format!("{total_cost:.4}"));
}

async fn persist(
    mission: &Mission,
    ctx: &Context,
    namespace: &str,
    status: &MissionStatus,
) -> Result<()> {
    let missions: Api<Mission> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = status_merge_patch(status, &[])?;
    missions
        .patch_status(
            &mission.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}
