//! shiftgrid-rollout: rolling deployment of one tier.
//!
//! A `DeploymentController` replaces a tier's instances wave by wave with
//! a target revision while keeping the tier's routing table above an
//! availability floor. A failed startup rolls the tier back to the
//! revision it ran before the plan.
//!
//! # Components
//!
//! - **`strategy`**: rolling parameters and wave arithmetic
//! - **`provisioner`**: the compute collaborator that prepares, starts,
//!   drains and terminates instances
//! - **`controller`**: the per-tier rollout state machine

pub mod controller;
pub mod error;
pub mod provisioner;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{ControllerState, DeployEvent, DeployEventKind, DeploymentController};
pub use error::{DeployError, DeployResult, ProvisionError, StartupFailure};
pub use provisioner::Provisioner;
pub use strategy::{RollingConfig, batch_count};
