//! shiftgrid-pipeline: moves a release through the tiers.
//!
//! A release maps tiers to revisions. The `PipelineController` turns it
//! into one deployment plan per tier and runs them in dependency order,
//! one at a time, stopping at the first plan that does not succeed.
//! Tiers that already succeeded are left on the new revision.
//!
//! Only one run may be active. A second submission is rejected with
//! `PipelineError::Conflict` until the active run ends.

pub mod error;
pub mod pipeline;
pub mod retry;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::PipelineController;
pub use retry::RetryPolicy;
