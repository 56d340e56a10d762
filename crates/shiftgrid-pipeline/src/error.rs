//! Pipeline error types.

use shiftgrid_state::{RunId, StateError, TierId};
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a pipeline run is already active")]
    Conflict,

    #[error("release names unknown tier {0}")]
    UnknownTier(TierId),

    #[error("release entry for tier {tier} carries a revision for tier {revision_tier}")]
    TierMismatch { tier: TierId, revision_tier: TierId },

    #[error("release is empty")]
    EmptyRelease,

    #[error("pipeline run {0} not found")]
    NotFound(RunId),

    #[error("pipeline run {0} is not active")]
    NotActive(RunId),

    #[error("pipeline order names tier {0}, which has no controller")]
    MissingController(TierId),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
