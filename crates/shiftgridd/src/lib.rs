//! shiftgridd: the Shiftgrid daemon.
//!
//! Single binary that assembles every Shiftgrid subsystem:
//! - State store (redb)
//! - Health registry
//! - Per-tier traffic routers and deployment controllers
//! - Datastore replica router
//! - Release pipeline
//! - Operator REST API

pub mod agent;
pub mod control_plane;

pub use agent::AgentProvisioner;
pub use control_plane::{AgentBackend, ComputeBackend, ControlPlane, run_control_plane};
