//! Operator binary: watches Agent, Pipeline, Mission and Fleet resources,
//! reconciles them into workloads and bus traffic, and serves health and
//! metrics endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_operator::bus::Bus;
use fleet_operator::controllers::Context;
use fleet_operator::leader::LeaderLock;
use fleet_operator::scheduler::CronScheduler;
use fleet_operator::OperatorConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_operator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fleet operator v{}", env!("CARGO_PKG_VERSION"));

    let config = OperatorConfig::from_env();
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    if config.enable_leader_election {
        let holder = format!(
            "fleet-operator-{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
        );
        let lock = LeaderLock::new(
            client.clone(),
            &config.namespace,
            "fleet-operator-leader",
            &holder,
        );
        lock.acquire_and_hold().await?;
    }

    let ctx = Arc::new(Context {
        client: client.clone(),
        bus: Arc::new(Bus::new(config.bus_url.clone())),
        scheduler: Arc::new(CronScheduler::new()),
    });

    let controller_handle = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet_operator::run_controllers(ctx).await {
                error!("Controller error: {e}");
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        );

    let listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
    info!("HTTP surface listening on {}", config.metrics_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Fleet operator stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "fleet-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "fleet-operator"
    }))
}

async fn metrics() -> Json<Value> {
    Json(json!({
        "service": "fleet-operator",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
