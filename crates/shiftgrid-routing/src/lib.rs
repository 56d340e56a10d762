//! shiftgrid-routing: where traffic goes.
//!
//! # Components
//!
//! - **`traffic`**: one `TrafficRouter` per tier, holding the routing
//!   table of instances that are both active and healthy
//! - **`replica`**: the `ReplicaRouter` for the datastore: write target,
//!   read targets, and failover driven by the role history
//! - **`balancer`**: lock-free round-robin selection

pub mod balancer;
pub mod error;
pub mod replica;
pub mod traffic;

pub use balancer::RoundRobinBalancer;
pub use error::{ReplicaError, ReplicaResult, RoutingError, RoutingResult};
pub use replica::ReplicaRouter;
pub use traffic::{DrainDecision, RemovalOutcome, TrafficRouter};
