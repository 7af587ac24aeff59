//! Fleet reconciler: aggregates health and cost across label-selected
//! agents, provisions JetStream streams, enforces the cost budget, and
//! rolls the result up into a fleet phase.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::stream::{self, RetentionPolicy, StorageType};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::discovery::member_agents;
use crate::bus::stream_name;
use crate::controllers::types::{
    finalizer_error, status_merge_patch, Context, Error, Result,
};
use crate::crds::fleet::{Fleet, FleetAgentSummary, FleetPhase, FleetPolicies, FleetStatus, StreamRetention};
use crate::crds::mission::MissionPhase;
use crate::crds::{set_condition, Condition, Mission};

pub const FLEET_FINALIZER: &str = "agents.platform/fleet-finalizer";

/// Forced periodic resync so rollups stay fresh without agent churn.
const RESYNC: Duration = Duration::from_secs(60);

/// Audit-trail stream shared by every fleet.
const EVENTS_STREAM: &str = "FLEET_EVENTS";

const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 3600);
const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 3600);
const ONE_HOUR: Duration = Duration::from_secs(3600);

#[instrument(skip(ctx), fields(fleet = %fleet.name_any()))]
pub async fn reconcile(fleet: Arc<Fleet>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = fleet.namespace().ok_or(Error::MissingObjectKey)?;
    let fleets: Api<Fleet> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&fleets, FLEET_FINALIZER, fleet, |event| async {
        match event {
            FinalizerEvent::Apply(fleet) => apply(fleet, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(fleet) => {
                // Streams are durable infrastructure; they outlive the fleet.
                debug!(fleet = %fleet.name_any(), "Fleet deleted, retaining streams");
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn apply(fleet: Arc<Fleet>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = fleet.name_any();
    let generation = fleet.metadata.generation;
    let mut status = fleet.status.clone().unwrap_or_default();

    if fleet.spec.suspended {
        status.phase = FleetPhase::Suspended;
        set_condition(
            &mut status.conditions,
            Condition::new("Available", "False", "Suspended", "Fleet is suspended", generation),
        );
        status.observed_generation = generation.unwrap_or_default();
        persist(&fleet, ctx, namespace, &status).await?;
        return Ok(Action::requeue(RESYNC));
    }

    // Agent discovery and health aggregation.
    let agents = member_agents(&ctx.client, &fleet).await?;
    let mut ready = 0i32;
    let mut total_tasks = 0i64;
    let mut total_cost = 0f64;
    let mut summaries = Vec::with_capacity(agents.len());

    for agent in &agents {
        let agent_status = agent.status.clone().unwrap_or_default();
        if agent_status.ready {
            ready += 1;
        }
        total_tasks += agent_status.tasks_completed;
        if let Some(cost) = agent_status
            .total_cost
            .as_deref()
            .and_then(|c| c.parse::<f64>().ok())
        {
            total_cost += cost;
        }
        summaries.push(FleetAgentSummary {
            name: agent.name_any(),
            ready: agent_status.ready,
            phase: agent_status.phase,
        });
    }

    let total = i32::try_from(agents.len()).unwrap_or(i32::MAX);
    status.agents_total = total;
    status.agents_ready = ready;
    status.agents = summaries;
    status.total_tasks_completed = total_tasks;
    status.total_cost = Some(format!("{total_cost:.4}"));

    // Stream provisioning is idempotent: existing streams are untouched.
    if fleet.spec.bus.create_streams {
        match ensure_streams(&fleet, ctx).await {
            Ok(()) => set_condition(
                &mut status.conditions,
                Condition::new(
                    "NATSReady",
                    "True",
                    "StreamsReady",
                    "JetStream streams are configured",
                    generation,
                ),
            ),
            Err(e) => {
                warn!(fleet = %name, "Stream provisioning failed: {e}");
                set_condition(
                    &mut status.conditions,
                    Condition::new("NATSReady", "False", "StreamError", &e.to_string(), generation),
                );
            }
        }
    }

    let phase = compute_phase(fleet.spec.policies.as_ref(), ready, total, total_cost);
    status.phase = phase.clone();

    status.active_missions = count_active_missions(ctx, namespace, &name).await.unwrap_or_else(|e| {
        warn!(fleet = %name, "Active mission count failed: {e}");
        0
    });

    let condition = match phase {
        FleetPhase::Ready => Condition::new(
            "Available",
            "True",
            "AllAgentsReady",
            &format!("All {total} agents are ready"),
            generation,
        ),
        FleetPhase::Degraded => Condition::new(
            "Available",
            "False",
            "AgentsDegraded",
            &format!("{ready}/{total} agents ready"),
            generation,
        ),
        FleetPhase::OverBudget => Condition::new(
            "Available",
            "False",
            "OverBudget",
            &format!(
                "Cost {total_cost:.4} exceeds budget {}",
                fleet
                    .spec
                    .policies
                    .as_ref()
                    .map_or("0", |p| p.cost_budget_usd.as_str())
            ),
            generation,
        ),
        _ => Condition::new(
            "Available",
            "False",
            "Provisioning",
            "Fleet is provisioning",
            generation,
        ),
    };
    set_condition(&mut status.conditions, condition);

    status.observed_generation = generation.unwrap_or_default();
    persist(&fleet, ctx, namespace, &status).await?;
    Ok(Action::requeue(RESYNC))
}

/// Budget first, then readiness: OverBudget > Provisioning > Ready > Degraded.
#[must_use]
pub fn compute_phase(
    policies: Option<&FleetPolicies>,
    ready: i32,
    total: i32,
    total_cost: f64,
) -> FleetPhase {
    if let Some(policies) = policies {
        let budget = policies.cost_budget_usd.as_str();
        if !budget.is_empty() && budget != "0" {
            if let Ok(limit) = budget.parse::<f64>() {
                if total_cost > limit {
                    return FleetPhase::OverBudget;
                }
            }
        }
    }

    if total == 0 {
        FleetPhase::Provisioning
    } else if ready == total {
        FleetPhase::Ready
    } else {
        FleetPhase::Degraded
    }
}

fn retention_policy(retention: &StreamRetention) -> RetentionPolicy {
    match retention {
        StreamRetention::Limits => RetentionPolicy::Limits,
        StreamRetention::Interest => RetentionPolicy::Interest,
        StreamRetention::WorkQueue => RetentionPolicy::WorkQueue,
    }
}

/// Ensure the fleet's four streams: tasks, results, the shared audit
/// stream, and the short-lived heartbeat stream.
async fn ensure_streams(fleet: &Fleet, ctx: &Context) -> Result<()> {
    let bus_spec = &fleet.spec.bus;
    let prefix = &bus_spec.subject_prefix;
    let retention = retention_policy(&bus_spec.stream_retention);

    ctx.bus
        .ensure_stream(stream::Config {
            name: bus_spec.tasks_stream.clone(),
            subjects: vec![format!("{prefix}.tasks.>")],
            retention,
            storage: StorageType::File,
            ..Default::default()
        })
        .await?;

    ctx.bus
        .ensure_stream(stream::Config {
            name: bus_spec.results_stream.clone(),
            subjects: vec![format!("{prefix}.results.>")],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: SEVEN_DAYS,
            ..Default::default()
        })
        .await?;

    ctx.bus
        .ensure_stream(stream::Config {
            name: EVENTS_STREAM.to_string(),
            subjects: vec![format!("{prefix}.events.>")],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: THIRTY_DAYS,
            ..Default::default()
        })
        .await?;

    ctx.bus
        .ensure_stream(stream::Config {
            name: stream_name(prefix, "heartbeat"),
            subjects: vec![format!("{prefix}.heartbeat.>")],
            retention: RetentionPolicy::Limits,
            storage: StorageType::Memory,
            max_age: ONE_HOUR,
            ..Default::default()
        })
        .await?;

    info!(fleet = %fleet.name_any(), prefix = %prefix, "Streams verified");
    Ok(())
}

/// Missions in the namespace referencing this fleet and still running.
async fn count_active_missions(ctx: &Context, namespace: &str, fleet_name: &str) -> Result<i32> {
    let missions: Api<Mission> = Api::namespaced(ctx.client.clone(), namespace);
    let list = missions.list(&ListParams::default()).await?;

    let count = list
        .items
        .iter()
        .filter(|m| m.spec.fleet_ref.as_deref() == Some(fleet_name))
        .filter(|m| {
            m.status.as_ref().is_some_and(|s| {
                matches!(
                    s.phase,
                    MissionPhase::Assembling | MissionPhase::Briefing | MissionPhase::Active
                )
            })
        })
        .count();

    Ok(i32::try_from(count).unwrap_or(i32::MAX))
}

async fn persist(fleet: &Fleet, ctx: &Context, namespace: &str, status: &FleetStatus) -> Result<()> {
    let fleets: Api<Fleet> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = status_merge_patch(status, &[])?;
    fleets
        .patch_status(
            &fleet.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies(budget: &str) -> FleetPolicies {
        FleetPolicies {
            cost_budget_usd: budget.to_string(),
            ..FleetPolicies::default()
        }
    }

    #[test]
    fn over_budget_wins_over_readiness() {
        let p = policies("10.00");
        assert_eq!(compute_phase(Some(&p), 3, 3, 15.0), FleetPhase::OverBudget);
    }

    #[test]
    fn zero_budget_means_unlimited() {
        let p = policies("0");
        assert_eq!(compute_phase(Some(&p), 2, 2, 1_000_000.0), FleetPhase::Ready);
    }

    #[test]
    fn cost_at_budget_is_not_over() {
        let p = policies("10.00");
        assert_eq!(compute_phase(Some(&p), 2, 2, 10.0), FleetPhase::Ready);
    }

    #[test]
    fn no_agents_is_provisioning() {
        assert_eq!(compute_phase(None, 0, 0, 0.0), FleetPhase::Provisioning);
    }

    #[test]
    fn partial_readiness_is_degraded() {
        assert_eq!(compute_phase(None, 1, 3, 0.0), FleetPhase::Degraded);
    }

    #[test]
    fn full_readiness_is_ready() {
        assert_eq!(compute_phase(None, 3, 3, 0.0), FleetPhase::Ready);
    }
}
