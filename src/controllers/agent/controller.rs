//! Agent reconciler: turns one Agent spec into a running workload with the
//! right sidecar topology, volumes and probes, and reports readiness from
//! the workload's replica counts.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::resources;
use crate::controllers::fleet::discovery::owning_fleet;
use crate::controllers::types::{
    finalizer_error, status_merge_patch, Context, Error, Result,
};
use crate::crds::agent::{Agent, AgentPhase, AgentStatus};
use crate::crds::{set_condition, Condition};

pub const AGENT_FINALIZER: &str = "agents.platform/finalizer";

#[instrument(skip(ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile(agent: Arc<Agent>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = agent.namespace().ok_or(Error::MissingObjectKey)?;
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&agents, AGENT_FINALIZER, agent, |event| async {
        match event {
            FinalizerEvent::Apply(agent) => apply(agent, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(agent) => cleanup(agent, &ctx).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn apply(agent: Arc<Agent>, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = agent.name_any();
    debug!("Reconciling agent {name}");

    if agent.spec.suspended {
        return suspend(&agent, ctx, namespace).await;
    }

    // A vault reference pointing at a claim that does not exist would wedge
    // the pod in ContainerCreating; surface it instead and poll slowly
    // (there is no watch on unowned claims).
    if let Some(vault) = &agent.spec.vault {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
        if pvcs.get_opt(&vault.claim_name).await?.is_none() {
            warn!("Vault claim {} for agent {name} not found", vault.claim_name);
            let mut status = agent.status.clone().unwrap_or_default();
            status.phase = AgentPhase::Degraded;
            status.ready = false;
            status.observed_generation = agent.metadata.generation.unwrap_or_default();
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "Available",
                    "False",
                    "VaultMissing",
                    &format!("vault claim {:?} does not exist", vault.claim_name),
                    agent.metadata.generation,
                ),
            );
            patch_status(&agent, ctx, namespace, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
    }

    let fleet = owning_fleet(&ctx.client, &agent).await.unwrap_or_else(|e| {
        warn!("Fleet lookup for agent {name} failed: {e}");
        None
    });
    let fleet_defaults = fleet.as_ref().and_then(|f| f.spec.defaults.clone());

    // Fixed effect order: config artifact, volumes, then the workload.
    let apply_error = match resources::apply_owned_objects(
        &agent,
        ctx,
        namespace,
        fleet_defaults.as_ref(),
    )
    .await
    {
        Ok(()) => None,
        Err(e) => {
            warn!("Owned object apply for agent {name} failed: {e}");
            Some(e)
        }
    };

    update_status(&agent, ctx, namespace, apply_error.as_ref()).await?;

    match apply_error {
        Some(e) => Err(e),
        // Owned-object watches re-trigger on workload changes; no resync.
        None => Ok(Action::await_change()),
    }
}

/// Scale the workload to zero and mark the agent Suspended.
async fn suspend(agent: &Agent, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = agent.name_any();
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);

    if let Some(deployment) = deployments.get_opt(&name).await? {
        let replicas = deployment.spec.and_then(|s| s.replicas).unwrap_or(1);
        if replicas != 0 {
            deployments
                .patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"spec": {"replicas": 0}})),
                )
                .await?;
            info!("Suspended agent {name}, scaled workload to 0");
        }
    }

    let mut status = agent.status.clone().unwrap_or_default();
    status.phase = AgentPhase::Suspended;
    status.ready = false;
    status.consumer_name = Some(agent.consumer_name());
    status.observed_generation = agent.metadata.generation.unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(
            "Available",
            "False",
            "Suspended",
            "Agent is suspended",
            agent.metadata.generation,
        ),
    );
    patch_status(agent, ctx, namespace, &status).await?;

    Ok(Action::await_change())
}

/// Derive phase and readiness from the workload and persist status.
async fn update_status(
    agent: &Agent,
    ctx: &Context,
    namespace: &str,
    apply_error: Option<&Error>,
) -> Result<()> {
    let name = agent.name_any();
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let ready_replicas = deployments
        .get_opt(&name)
        .await?
        .and_then(|d| d.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    let mut status = agent.status.clone().unwrap_or_default();
    let generation = agent.metadata.generation;

    if let Some(error) = apply_error {
        status.phase = AgentPhase::Degraded;
        status.ready = false;
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Available",
                "False",
                "ReconcileError",
                &error.to_string(),
                generation,
            ),
        );
    } else if ready_replicas > 0 {
        status.phase = AgentPhase::Ready;
        status.ready = true;
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Available",
                "True",
                "AgentReady",
                &format!("Agent {name} is ready and accepting tasks"),
                generation,
            ),
        );
    } else {
        status.phase = AgentPhase::Provisioning;
        status.ready = false;
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Available",
                "False",
                "Provisioning",
                "Agent workload is being provisioned",
                generation,
            ),
        );
    }

    status.consumer_name = Some(agent.consumer_name());
    status.observed_generation = generation.unwrap_or_default();
    patch_status(agent, ctx, namespace, &status).await
}

async fn patch_status(
    agent: &Agent,
    ctx: &Context,
    namespace: &str,
    status: &AgentStatus,
) -> Result<()> {
    let agents: Api<Agent> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = status_merge_patch(status, &[])?;
    agents
        .patch_status(
            &agent.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/// Deletion path: tear down the durable bus consumer, then let the
/// finalizer clear. Owned objects cascade through their owner references.
async fn cleanup(agent: Arc<Agent>, ctx: &Context) -> Result<Action> {
    let name = agent.name_any();
    let consumer = agent.consumer_name();
    info!("Cleaning up agent {name}: removing bus consumer {consumer}");

    if let Err(e) = ctx
        .bus
        .delete_consumer(&agent.spec.bus.stream, &consumer)
        .await
    {
        // Surfaced but not fatal: the stream may be gone already, and the
        // finalizer must not wedge deletion on bus availability.
        warn!("Bus consumer teardown for agent {name} failed: {e}");
    }

    Ok(Action::await_change())
}
