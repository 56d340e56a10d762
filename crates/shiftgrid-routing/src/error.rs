//! Routing error types.

use shiftgrid_state::{InstanceId, NodeId, StateError, TierId};
use thiserror::Error;

pub type RoutingResult<T> = Result<T, RoutingError>;
pub type ReplicaResult<T> = Result<T, ReplicaError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("tier {tier}: wanted {wanted} eligible instances, have {have} after timeout")]
    Timeout {
        tier: TierId,
        wanted: usize,
        have: usize,
    },

    #[error("tier {tier}: unknown instance {instance}")]
    UnknownInstance { tier: TierId, instance: InstanceId },
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("primary {0} is unreachable")]
    PrimaryUnreachable(NodeId),

    #[error("no healthy replica available")]
    NoHealthyReplica,

    #[error("unknown datastore node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is already the primary")]
    AlreadyPrimary(NodeId),

    #[error("node {0} is not healthy")]
    NotHealthy(NodeId),

    #[error("invalid datastore topology: {0}")]
    Topology(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
