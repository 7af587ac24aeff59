//! Mission reconciliation: phase machine, TTL expiry, and teardown.

pub mod controller;

pub use controller::{reconcile, MISSION_FINALIZER};
