//! In-memory provisioner for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shiftgrid_health::{BoxFuture, Probe, ProbeResult};
use shiftgrid_state::{InstanceId, InstanceSlot, Revision};

pub use shiftgrid_health::testing::ScriptedProbe;

use crate::error::ProvisionError;
use crate::provisioner::Provisioner;

/// How instances of an artifact behave once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// Every probe fails.
    Unhealthy,
    /// The first `n` starts come up healthy, later ones never do.
    HealthyFirst(u32),
    /// `start` itself fails.
    StartError(ProvisionError),
}

/// One call made against the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    Prepare { artifact: String },
    Start { instance: InstanceId, artifact: String },
    Drain { instance: InstanceId },
    Terminate { instance: InstanceId },
}

#[derive(Default)]
struct FakeState {
    behaviors: HashMap<String, Behavior>,
    starts: HashMap<String, u32>,
    prepare_failures: VecDeque<ProvisionError>,
    start_delay: Option<Duration>,
    drain_delay: Option<Duration>,
    calls: Vec<ProvisionCall>,
}

/// A provisioner whose instances are scripted probes.
///
/// Artifacts without a configured behavior start healthy.
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A probe that always succeeds, for adopting pre-existing instances.
    pub fn healthy_probe() -> Arc<dyn Probe> {
        Arc::new(ScriptedProbe::always(ProbeResult::Success))
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, artifact: &str, behavior: Behavior) {
        self.lock().behaviors.insert(artifact.to_string(), behavior);
    }

    /// Fail the next `prepare` call with `error`.
    pub fn fail_next_prepare(&self, error: ProvisionError) {
        self.lock().prepare_failures.push_back(error);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    pub fn set_drain_delay(&self, delay: Duration) {
        self.lock().drain_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.lock().calls.clone()
    }

    /// Ids of every terminated instance, in order.
    pub fn terminated(&self) -> Vec<InstanceId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                ProvisionCall::Terminate { instance } => Some(instance.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Provisioner for FakeProvisioner {
    fn prepare<'a>(&'a self, revision: &'a Revision) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(ProvisionCall::Prepare {
                artifact: revision.artifact.clone(),
            });
            match state.prepare_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn start<'a>(
        &'a self,
        slot: &'a InstanceSlot,
    ) -> BoxFuture<'a, Result<Arc<dyn Probe>, ProvisionError>> {
        Box::pin(async move {
            let artifact = slot.revision.artifact.clone();
            let (delay, behavior, nth) = {
                let mut state = self.lock();
                state.calls.push(ProvisionCall::Start {
                    instance: slot.id.clone(),
                    artifact: artifact.clone(),
                });
                let count = state.starts.entry(artifact.clone()).or_insert(0);
                *count += 1;
                let nth = *count;
                let behavior = state
                    .behaviors
                    .get(&artifact)
                    .cloned()
                    .unwrap_or(Behavior::Healthy);
                (state.start_delay, behavior, nth)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let result = match behavior {
                Behavior::Healthy => ProbeResult::Success,
                Behavior::Unhealthy => ProbeResult::Failure,
                Behavior::HealthyFirst(n) if nth <= n => ProbeResult::Success,
                Behavior::HealthyFirst(_) => ProbeResult::Failure,
                Behavior::StartError(e) => return Err(e),
            };
            let probe: Arc<dyn Probe> = Arc::new(ScriptedProbe::always(result));
            Ok(probe)
        })
    }

    fn drain<'a>(&'a self, slot: &'a InstanceSlot) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.lock();
                state.calls.push(ProvisionCall::Drain {
                    instance: slot.id.clone(),
                });
                state.drain_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
    }

    fn terminate<'a>(
        &'a self,
        slot: &'a InstanceSlot,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            self.lock().calls.push(ProvisionCall::Terminate {
                instance: slot.id.clone(),
            });
            Ok(())
        })
    }
}
