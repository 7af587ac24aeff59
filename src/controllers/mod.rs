//! The four reconciliation loops, run concurrently against a shared
//! context. Reconciles for different resources run in parallel; the
//! controller runtime serializes reconciles for any single resource.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument};

pub mod agent;
pub mod fleet;
pub mod mission;
pub mod pipeline;
pub mod types;

pub use types::{Context, Error, Result};

use crate::crds::{Agent, Fleet, Mission, Pipeline};

/// Start all four controllers and run until the process shuts down.
#[instrument(skip(ctx))]
pub async fn run_controllers(ctx: Arc<Context>) -> Result<()> {
    info!("Starting agent, pipeline, mission and fleet controllers");

    let agent_handle = tokio::spawn(run_agent_controller(ctx.client.clone(), ctx.clone()));
    let pipeline_handle = tokio::spawn(run_pipeline_controller(ctx.client.clone(), ctx.clone()));
    let mission_handle = tokio::spawn(run_mission_controller(ctx.client.clone(), ctx.clone()));
    let fleet_handle = tokio::spawn(run_fleet_controller(ctx.client.clone(), ctx.clone()));

    match tokio::try_join!(agent_handle, pipeline_handle, mission_handle, fleet_handle) {
        Ok(_) => info!("Controllers shut down"),
        Err(e) => error!("Controller join error: {e:?}"),
    }
    Ok(())
}

async fn run_agent_controller(client: Client, ctx: Arc<Context>) {
    let agents: Api<Agent> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let configmaps: Api<ConfigMap> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client);
    let watcher = WatcherConfig::default().any_semantic();

    Controller::new(agents, watcher.clone())
        .owns(deployments, watcher.clone())
        .owns(configmaps, watcher.clone())
        .owns(pvcs, watcher)
        .run(agent::reconcile, error_policy_agent, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Agent reconciled"),
                Err(e) => error!(error = ?e, "Agent reconcile error"),
            }
        })
        .await;
}

async fn run_pipeline_controller(client: Client, ctx: Arc<Context>) {
    let pipelines: Api<Pipeline> = Api::all(client);
    Controller::new(pipelines, WatcherConfig::default().any_semantic())
        .run(pipeline::reconcile, error_policy_pipeline, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Pipeline reconciled"),
                Err(e) => error!(error = ?e, "Pipeline reconcile error"),
            }
        })
        .await;
}

async fn run_mission_controller(client: Client, ctx: Arc<Context>) {
    let missions: Api<Mission> = Api::all(client);
    Controller::new(missions, WatcherConfig::default().any_semantic())
        .run(mission::reconcile, error_policy_mission, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Mission reconciled"),
                Err(e) => error!(error = ?e, "Mission reconcile error"),
            }
        })
        .await;
}

async fn run_fleet_controller(client: Client, ctx: Arc<Context>) {
    let fleets: Api<Fleet> = Api::all(client);
    Controller::new(fleets, WatcherConfig::default().any_semantic())
        .run(fleet::reconcile, error_policy_fleet, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(resource = ?obj, "Fleet reconciled"),
                Err(e) => error!(error = ?e, "Fleet reconcile error"),
            }
        })
        .await;
}

// Transient infrastructure errors recover by requeue; validation errors
// already landed in conditions and wait for spec edits.

fn error_policy_agent(agent: Arc<Agent>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(agent = %agent.name_any(), error = ?err, "Agent reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

fn error_policy_pipeline(pipeline: Arc<Pipeline>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(pipeline = %pipeline.name_any(), error = ?err, "Pipeline reconciliation failed");
    Action::requeue(Duration::from_secs(10))
}

fn error_policy_mission(mission: Arc<Mission>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(mission = %mission.name_any(), error = ?err, "Mission reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

fn error_policy_fleet(fleet: Arc<Fleet>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(fleet = %fleet.name_any(), error = ?err, "Fleet reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}
