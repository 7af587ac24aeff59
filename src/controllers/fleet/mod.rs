//! Fleet reconciliation: membership discovery, health/cost rollup, and
//! stream provisioning.

pub mod controller;
pub mod discovery;

pub use controller::{compute_phase, reconcile, FLEET_FINALIZER};
