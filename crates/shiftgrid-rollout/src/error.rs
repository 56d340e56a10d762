//! Rollout error types.

use std::fmt;

use shiftgrid_state::TierId;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

/// Failure reported by the compute collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// Worth retrying: agent unreachable, 5xx, capacity briefly exhausted.
    #[error("transient provisioning failure: {0}")]
    Transient(String),

    /// Retrying will not help: bad artifact, rejected request.
    #[error("provisioning failed: {0}")]
    Fatal(String),
}

impl ProvisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Transient(_))
    }
}

/// Errors that keep a plan from starting. A plan that started always ends
/// with a terminal status instead.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("tier {tier} already has an active deployment")]
    Conflict { tier: TierId },

    #[error("tier {tier}: failed to prepare revision: {source}")]
    Prepare {
        tier: TierId,
        #[source]
        source: ProvisionError,
    },

    #[error("plan targets tier {got}, controller owns tier {expected}")]
    TierMismatch { expected: TierId, got: TierId },

    #[error("plan {0} is not pending")]
    NotPending(String),
}

impl DeployError {
    /// Whether the caller may retry the same plan later.
    pub fn is_transient(&self) -> bool {
        match self {
            DeployError::Conflict { .. } => true,
            DeployError::Prepare { source, .. } => source.is_transient(),
            DeployError::TierMismatch { .. } | DeployError::NotPending(_) => false,
        }
    }
}

/// Why a new instance did not become healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupFailure {
    Unhealthy,
    TimedOut,
    Start(ProvisionError),
    /// The instance was removed from the health registry mid-startup.
    Removed,
    Cancelled,
}

impl fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupFailure::Unhealthy => write!(f, "declared unhealthy"),
            StartupFailure::TimedOut => write!(f, "startup timeout"),
            StartupFailure::Start(e) => write!(f, "start failed: {e}"),
            StartupFailure::Removed => write!(f, "removed during startup"),
            StartupFailure::Cancelled => write!(f, "aborted"),
        }
    }
}
