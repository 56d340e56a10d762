//! The compute collaborator.
//!
//! The controller never runs instances itself. It asks a `Provisioner` to
//! prepare an artifact, start an instance (returning the probe that checks
//! it), drain it and terminate it. The daemon drives a per-tier HTTP agent;
//! tests use `testing::FakeProvisioner`.

use std::sync::Arc;

use shiftgrid_health::{BoxFuture, Probe};
use shiftgrid_state::{InstanceSlot, Revision};

use crate::error::ProvisionError;

pub trait Provisioner: Send + Sync {
    /// Make the revision's artifact available on the tier's hosts.
    fn prepare<'a>(&'a self, revision: &'a Revision) -> BoxFuture<'a, Result<(), ProvisionError>>;

    /// Start an instance for the slot and return its health probe.
    fn start<'a>(
        &'a self,
        slot: &'a InstanceSlot,
    ) -> BoxFuture<'a, Result<Arc<dyn Probe>, ProvisionError>>;

    /// Stop routing new work to the instance and resolve once in-flight
    /// work has finished.
    fn drain<'a>(&'a self, slot: &'a InstanceSlot) -> BoxFuture<'a, Result<(), ProvisionError>>;

    /// Destroy the instance.
    fn terminate<'a>(&'a self, slot: &'a InstanceSlot)
    -> BoxFuture<'a, Result<(), ProvisionError>>;
}
