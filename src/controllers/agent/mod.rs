//! Agent reconciliation: workload composition and readiness reporting.

pub mod controller;
pub mod resources;

pub use controller::{reconcile, AGENT_FINALIZER};
