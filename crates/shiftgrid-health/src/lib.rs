//! shiftgrid-health: the health registry.
//!
//! Every instance slot and datastore node is probed on a fixed interval.
//! Results feed a per-entity `HealthTracker` that only flips status after
//! a run of consecutive like results, and every flip is published on a
//! broadcast feed.
//!
//! # Architecture
//!
//! ```text
//! HealthRegistry
//!   ├── Per-entity background task
//!   │   ├── Probe::check() bounded by the probe timeout
//!   │   └── HealthTracker (consecutive successes / failures)
//!   └── broadcast::Sender<HealthEvent>
//!         ├── TrafficRouter (one per tier)
//!         ├── ReplicaRouter
//!         └── DeploymentController (startup waits)
//! ```
//!
//! A timed-out probe counts as a failure. Removing an entity stops its
//! task and discards its state.

pub mod checker;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checker::{
    BoxFuture, HealthTracker, HttpProbe, Probe, ProbeResult, ProbeSettings, TcpProbe,
};
pub use registry::{HealthEvent, HealthRegistry, Resolution};
