//! Coordination engine for the EdgeMesh worker pool.
//!
//! The [`coordinator::Coordinator`] is the only gatekeeper of the store: it
//! runs every multi-row mutation under a single transaction and publishes
//! change notifications on the [`bus::EventBus`] after commit. Scheduling
//! decisions are delegated to the pure [`scheduler`] policy so the
//! dispatcher and the dry-run simulator can never disagree.

pub mod bus;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod scheduler;
