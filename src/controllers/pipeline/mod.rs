//! Pipeline reconciliation: DAG validation, cron scheduling, and
//! bus-driven step execution.

pub mod controller;
pub mod dag;
pub mod template;

pub use controller::{reconcile, PIPELINE_FINALIZER};
