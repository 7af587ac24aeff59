#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Fleet operator core library
//!
//! Reconciles four custom resource kinds (Agent, Pipeline, Mission and
//! Fleet) into running workloads wired onto NATS JetStream, driving their
//! lifecycles through explicit state machines.

pub mod bus;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod leader;
pub mod scheduler;

// Re-export commonly used types
pub use config::OperatorConfig;
pub use controllers::{run_controllers, Context};
pub use crds::{Agent, Fleet, Mission, Pipeline};
