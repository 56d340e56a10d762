//! Deployment controller: drives a tier through a rolling update.
//!
//! One controller owns one tier. A plan runs as a sequence of waves:
//!
//! ```text
//! start up to batch_size new slots ──► wait healthy (bounded, retried)
//!        │ failure                          │ all healthy
//!        ▼                                  ▼
//!   rollback                      activate new slots
//!                                           │
//!                                           ▼
//!                       drain as many old slots, never below the floor
//!                                           │
//!                                           ▼
//!                                   terminate drained slots
//! ```
//!
//! The floor is the routing-table size at plan start minus
//! `max_unavailable`. Only one plan may run per tier; a second caller
//! gets `DeployError::Conflict`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use shiftgrid_core::signal::{is_cancelled, never};
use shiftgrid_health::{HealthRegistry, Probe, Resolution};
use shiftgrid_routing::{RemovalOutcome, TrafficRouter};
use shiftgrid_state::{
    DeploymentPlan, InstanceId, InstanceSlot, Lifecycle, PlanStatus, Revision, StateStore, TierId,
};

use crate::error::{DeployError, DeployResult, StartupFailure};
use crate::provisioner::Provisioner;
use crate::strategy::{RollingConfig, availability_floor, batch_count};

const EVENT_CAPACITY: usize = 512;

/// Where a tier's controller stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Rolling {
        plan_id: String,
        target: String,
        wave: u32,
        total_waves: u32,
    },
    Finished {
        plan_id: String,
        status: PlanStatus,
        reason: Option<String>,
    },
}

/// Progress of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployEvent {
    pub tier: TierId,
    pub plan_id: String,
    pub kind: DeployEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEventKind {
    PlanStarted { total_waves: u32 },
    WaveStarted { wave: u32, size: usize },
    WaveCompleted { wave: u32 },
    InstanceStarted { instance: InstanceId, attempt: u32 },
    InstanceHealthy { instance: InstanceId },
    InstanceFailed {
        instance: InstanceId,
        attempt: u32,
        reason: String,
    },
    InstanceDraining { instance: InstanceId },
    DrainTimedOut { instance: InstanceId },
    InstanceTerminated { instance: InstanceId },
    RollbackStarted { reason: String },
    PlanFinished {
        status: PlanStatus,
        reason: Option<String>,
    },
}

struct SlotEntry {
    slot: InstanceSlot,
    /// Creation order; lower is older.
    order: u64,
}

struct ControllerInner {
    tier: TierId,
    registry: HealthRegistry,
    router: Arc<TrafficRouter>,
    provisioner: Arc<dyn Provisioner>,
    config: RollingConfig,
    store: Option<StateStore>,
    slots: Mutex<BTreeMap<InstanceId, SlotEntry>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    state: watch::Sender<ControllerState>,
    events: broadcast::Sender<DeployEvent>,
    seq: AtomicU64,
}

/// Rolls one tier. Cheap to clone; clones drive the same tier.
#[derive(Clone)]
pub struct DeploymentController {
    inner: Arc<ControllerInner>,
}

impl DeploymentController {
    pub fn new(
        tier: &str,
        registry: HealthRegistry,
        router: Arc<TrafficRouter>,
        provisioner: Arc<dyn Provisioner>,
        config: RollingConfig,
        store: Option<StateStore>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                tier: tier.to_string(),
                registry,
                router,
                provisioner,
                config,
                store,
                slots: Mutex::new(BTreeMap::new()),
                gate: Arc::new(tokio::sync::Mutex::new(())),
                state,
                events,
                seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn tier(&self) -> &str {
        &self.inner.tier
    }

    pub fn config(&self) -> &RollingConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.inner.router
    }

    pub fn state(&self) -> ControllerState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a plan currently holds the tier.
    pub fn is_busy(&self) -> bool {
        self.inner.gate.try_lock().is_err()
    }

    /// Every live slot, oldest first.
    pub fn slots(&self) -> Vec<InstanceSlot> {
        let slots = self.slots_lock();
        let mut entries: Vec<&SlotEntry> = slots.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().map(|e| e.slot.clone()).collect()
    }

    /// A pending plan for this tier using the configured rolling parameters.
    pub fn plan(&self, id: &str, target: Revision) -> DeploymentPlan {
        DeploymentPlan::new(
            id,
            target,
            self.inner.config.batch_size,
            self.inner.config.max_unavailable,
        )
    }

    /// Register an instance that was already running when the daemon started.
    pub fn adopt(&self, slot: InstanceSlot, probe: Arc<dyn Probe>) {
        let id = slot.id.clone();
        let order = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.router.track(&id, slot.lifecycle);
        self.inner.registry.register(&id, probe);
        self.persist(&slot);
        info!(tier = %self.inner.tier, instance = %id, revision = %slot.revision.artifact, "adopted instance");
        self.slots_lock().insert(id, SlotEntry { slot, order });
    }

    /// Run a plan to a terminal status.
    ///
    /// Returns an error only when the plan could not begin: the tier is
    /// busy, the plan is for another tier, or the revision could not be
    /// prepared. Raising `cancel` rolls the tier back and ends the plan
    /// `rolled_back` with reason "aborted".
    pub async fn deploy(
        &self,
        mut plan: DeploymentPlan,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<DeploymentPlan> {
        if plan.tier != self.inner.tier {
            return Err(DeployError::TierMismatch {
                expected: self.inner.tier.clone(),
                got: plan.tier,
            });
        }
        if plan.status != PlanStatus::Pending {
            return Err(DeployError::NotPending(plan.id));
        }
        let guard = Arc::clone(&self.inner.gate)
            .try_lock_owned()
            .map_err(|_| DeployError::Conflict {
                tier: self.inner.tier.clone(),
            })?;

        if let Err(source) = self.inner.provisioner.prepare(&plan.target).await {
            warn!(tier = %self.inner.tier, plan = %plan.id, error = %source, "prepare failed");
            return Err(DeployError::Prepare {
                tier: self.inner.tier.clone(),
                source,
            });
        }

        plan.begin();
        let mut rollout = Rollout {
            ctrl: self,
            plan,
            cancel,
            floor: 0,
            activated: Vec::new(),
            _guard: guard,
        };
        Ok(rollout.execute().await)
    }

    fn slots_lock(&self) -> MutexGuard<'_, BTreeMap<InstanceId, SlotEntry>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, plan_id: &str, kind: DeployEventKind) {
        let _ = self.inner.events.send(DeployEvent {
            tier: self.inner.tier.clone(),
            plan_id: plan_id.to_string(),
            kind,
        });
    }

    fn persist(&self, slot: &InstanceSlot) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.put_slot(slot) {
                warn!(instance = %slot.id, error = %e, "failed to persist slot");
            }
        }
    }

    fn slot(&self, id: &str) -> Option<InstanceSlot> {
        self.slots_lock().get(id).map(|e| e.slot.clone())
    }

    fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) {
        let updated = {
            let mut slots = self.slots_lock();
            slots.get_mut(id).map(|e| {
                e.slot.lifecycle = lifecycle;
                e.slot.clone()
            })
        };
        if let Some(slot) = updated {
            if let Err(e) = self.inner.router.set_lifecycle(id, lifecycle) {
                warn!(instance = %id, error = %e, "router does not know slot");
            }
            self.persist(&slot);
        }
    }

    /// Create a `Starting` slot with a fresh id.
    fn allocate(&self, revision: &Revision) -> InstanceSlot {
        let mut slots = self.slots_lock();
        let (id, order) = loop {
            let n = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            let id = format!("{}-{n}", self.inner.tier);
            if !slots.contains_key(&id) {
                break (id, n);
            }
        };
        let slot = InstanceSlot::new(&id, revision.clone(), Lifecycle::Starting);
        slots.insert(
            id.clone(),
            SlotEntry {
                slot: slot.clone(),
                order,
            },
        );
        drop(slots);

        self.inner.router.track(&id, Lifecycle::Starting);
        self.persist(&slot);
        slot
    }

    /// Terminate a slot and forget it everywhere.
    async fn destroy(&self, plan_id: &str, id: &str) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        if let Err(e) = self.inner.provisioner.terminate(&slot).await {
            error!(tier = %self.inner.tier, instance = %id, error = %e, "terminate failed");
        }
        self.inner.registry.remove(id);
        match self.inner.router.retire(id) {
            Ok(RemovalOutcome::Removed) | Err(_) => {}
            Ok(RemovalOutcome::Unsafe) => {
                warn!(tier = %self.inner.tier, instance = %id, "terminated slot still routed; removal deferred");
            }
        }
        self.slots_lock().remove(id);
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.delete_slot(&slot.table_key()) {
                warn!(instance = %id, error = %e, "failed to delete slot record");
            }
        }
        self.emit(
            plan_id,
            DeployEventKind::InstanceTerminated {
                instance: id.to_string(),
            },
        );
        debug!(tier = %self.inner.tier, instance = %id, "slot terminated");
    }

    /// Start one new instance, retrying failed startups.
    async fn launch(
        &self,
        plan_id: String,
        revision: Revision,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<InstanceId, StartupFailure> {
        let config = &self.inner.config;
        let mut last = StartupFailure::TimedOut;

        for attempt in 1..=config.attempts() {
            if is_cancelled(&cancel) {
                return Err(StartupFailure::Cancelled);
            }

            let slot = self.allocate(&revision);
            let id = slot.id.clone();
            self.emit(
                &plan_id,
                DeployEventKind::InstanceStarted {
                    instance: id.clone(),
                    attempt,
                },
            );
            debug!(tier = %self.inner.tier, instance = %id, attempt, revision = %revision.artifact, "starting instance");

            let failure = match self.inner.provisioner.start(&slot).await {
                Err(e) => StartupFailure::Start(e),
                Ok(probe) => {
                    self.inner.registry.register(&id, probe);
                    let resolution = self
                        .inner
                        .registry
                        .wait_for_resolution(&id, config.startup_timeout, &mut cancel)
                        .await;
                    match resolution {
                        Resolution::Healthy => {
                            self.emit(&plan_id, DeployEventKind::InstanceHealthy { instance: id.clone() });
                            return Ok(id);
                        }
                        Resolution::Unhealthy => StartupFailure::Unhealthy,
                        Resolution::TimedOut => StartupFailure::TimedOut,
                        Resolution::Removed => StartupFailure::Removed,
                        Resolution::Cancelled => {
                            self.destroy(&plan_id, &id).await;
                            return Err(StartupFailure::Cancelled);
                        }
                    }
                }
            };

            warn!(
                tier = %self.inner.tier,
                instance = %id,
                attempt,
                attempts = config.attempts(),
                reason = %failure,
                "instance failed to start"
            );
            self.emit(
                &plan_id,
                DeployEventKind::InstanceFailed {
                    instance: id.clone(),
                    attempt,
                    reason: failure.to_string(),
                },
            );
            self.destroy(&plan_id, &id).await;

            let fatal = matches!(&failure, StartupFailure::Start(e) if !e.is_transient());
            last = failure;
            if fatal {
                break;
            }
        }
        Err(last)
    }

    /// Drain a slot, bounded by the drain timeout, then destroy it.
    async fn drain_and_destroy(&self, plan_id: String, id: InstanceId) {
        let Some(slot) = self.slot(&id) else {
            return;
        };
        self.set_lifecycle(&id, Lifecycle::Draining);
        self.emit(&plan_id, DeployEventKind::InstanceDraining { instance: id.clone() });

        let drain_timeout = self.inner.config.drain_timeout;
        match tokio::time::timeout(drain_timeout, self.inner.provisioner.drain(&slot)).await {
            Ok(Ok(())) => debug!(tier = %self.inner.tier, instance = %id, "drained"),
            Ok(Err(e)) => {
                warn!(tier = %self.inner.tier, instance = %id, error = %e, "drain failed, terminating");
            }
            Err(_) => {
                warn!(
                    tier = %self.inner.tier,
                    instance = %id,
                    timeout = ?drain_timeout,
                    "drain timed out, forcing termination"
                );
                self.emit(&plan_id, DeployEventKind::DrainTimedOut { instance: id.clone() });
            }
        }
        self.destroy(&plan_id, &id).await;
    }
}

/// Why a drain could not proceed.
struct FloorHeld {
    held: usize,
}

/// One plan in flight. Holds the tier's gate until dropped.
struct Rollout<'a> {
    ctrl: &'a DeploymentController,
    plan: DeploymentPlan,
    cancel: watch::Receiver<bool>,
    floor: usize,
    /// New slots that went active, with the revision they displaced.
    activated: Vec<(InstanceId, Revision)>,
    _guard: OwnedMutexGuard<()>,
}

impl Rollout<'_> {
    fn tier(&self) -> &str {
        &self.ctrl.inner.tier
    }

    fn emit(&self, kind: DeployEventKind) {
        self.ctrl.emit(&self.plan.id, kind);
    }

    fn set_state(&self, wave: u32, total_waves: u32) {
        self.ctrl.inner.state.send_replace(ControllerState::Rolling {
            plan_id: self.plan.id.clone(),
            target: self.plan.target.artifact.clone(),
            wave,
            total_waves,
        });
    }

    async fn execute(&mut self) -> DeploymentPlan {
        let ctrl = self.ctrl;
        let serving = ctrl.inner.router.current_set().len();
        self.floor = availability_floor(serving, self.plan.max_unavailable);

        // Active slots not yet at the target, oldest first.
        let outdated: Vec<(InstanceId, Revision)> = ctrl
            .slots()
            .into_iter()
            .filter(|s| s.lifecycle == Lifecycle::Active && !s.revision.same_artifact(&self.plan.target))
            .map(|s| (s.id, s.revision))
            .collect();

        let batch = self.plan.batch_size.max(1) as usize;
        let total_waves = batch_count(outdated.len() as u32, batch as u32);
        info!(
            tier = %self.tier(),
            plan = %self.plan.id,
            target = %self.plan.target.artifact,
            outdated = outdated.len(),
            serving,
            floor = self.floor,
            total_waves,
            "plan started"
        );
        self.emit(DeployEventKind::PlanStarted { total_waves });

        for (index, wave) in outdated.chunks(batch).enumerate() {
            let number = index as u32 + 1;
            if is_cancelled(&self.cancel) {
                return self.rollback("aborted".to_string()).await;
            }
            self.set_state(number, total_waves);
            self.emit(DeployEventKind::WaveStarted {
                wave: number,
                size: wave.len(),
            });

            // Start the wave's new slots in parallel.
            let mut launches = JoinSet::new();
            for _ in wave {
                let ctrl = self.ctrl.clone();
                let plan_id = self.plan.id.clone();
                let target = self.plan.target.clone();
                let cancel = self.cancel.clone();
                launches.spawn(async move { ctrl.launch(plan_id, target, cancel).await });
            }

            let mut started = Vec::new();
            let mut failure = None;
            while let Some(joined) = launches.join_next().await {
                match joined {
                    Ok(Ok(id)) => started.push(id),
                    Ok(Err(e)) => {
                        if failure.is_none() || e == StartupFailure::Cancelled {
                            failure = Some(e);
                        }
                    }
                    Err(e) => {
                        error!(tier = %self.tier(), error = %e, "launch task panicked");
                        if failure.is_none() {
                            failure = Some(StartupFailure::Removed);
                        }
                    }
                }
            }

            if let Some(failure) = failure {
                // Healthy but never activated; nothing routes to them yet.
                for id in &started {
                    self.ctrl.destroy(&self.plan.id, id).await;
                }
                let reason = match failure {
                    StartupFailure::Cancelled => "aborted".to_string(),
                    other => format!(
                        "wave {number}: new instance did not become healthy after {} attempts ({other})",
                        self.ctrl.inner.config.attempts()
                    ),
                };
                return self.rollback(reason).await;
            }

            for (new_id, (_, old_revision)) in started.iter().zip(wave) {
                self.ctrl.set_lifecycle(new_id, Lifecycle::Active);
                self.activated.push((new_id.clone(), old_revision.clone()));
            }

            let old_ids: Vec<InstanceId> = wave.iter().map(|(id, _)| id.clone()).collect();
            if let Err(held) = self.drain_guarded(old_ids).await {
                let reason = format!(
                    "availability floor of {} held {} instance(s) from draining for {:?}",
                    self.floor, held.held, self.ctrl.inner.config.startup_timeout
                );
                return self.finish(PlanStatus::Failed, Some(reason));
            }

            self.plan.waves_completed = number;
            self.emit(DeployEventKind::WaveCompleted { wave: number });
            info!(tier = %self.tier(), plan = %self.plan.id, wave = number, total_waves, "wave completed");
        }

        self.finish(PlanStatus::Succeeded, None)
    }

    /// Drain `ids` without taking the routing table below the floor.
    ///
    /// Held slots are retried whenever the table or health changes, for up
    /// to the startup timeout.
    async fn drain_guarded(&self, mut ids: Vec<InstanceId>) -> Result<(), FloorHeld> {
        let ctrl = self.ctrl;
        let router = &ctrl.inner.router;
        let mut tables = router.subscribe();
        let mut health = ctrl.inner.registry.subscribe();
        let deadline = tokio::time::Instant::now() + ctrl.inner.config.startup_timeout;
        let mut drains = JoinSet::new();

        let outcome = loop {
            let decision = router.begin_drain(&ids, self.floor);
            for id in decision.draining {
                let ctrl = ctrl.clone();
                let plan_id = self.plan.id.clone();
                drains.spawn(async move { ctrl.drain_and_destroy(plan_id, id).await });
            }
            ids = decision.held;
            if ids.is_empty() {
                break Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(tier = %self.tier(), held = ids.len(), floor = self.floor, "drain blocked by availability floor");
                    break Err(FloorHeld { held: ids.len() });
                }
                _ = tables.changed() => {}
                _ = health.recv() => {}
            }
        };

        while let Some(joined) = drains.join_next().await {
            if let Err(e) = joined {
                error!(tier = %self.tier(), error = %e, "drain task panicked");
            }
        }
        outcome
    }

    /// Put the pre-plan revision back behind every activated new slot.
    async fn rollback(&mut self, reason: String) -> DeploymentPlan {
        warn!(tier = %self.tier(), plan = %self.plan.id, reason = %reason, "rolling back");
        self.emit(DeployEventKind::RollbackStarted {
            reason: reason.clone(),
        });

        let activated = std::mem::take(&mut self.activated);
        let mut unrestored = 0usize;
        for (new_id, old_revision) in activated.into_iter().rev() {
            let replacement = self
                .ctrl
                .launch(self.plan.id.clone(), old_revision.clone(), never())
                .await;
            match replacement {
                Ok(id) => {
                    self.ctrl.set_lifecycle(&id, Lifecycle::Active);
                    if self.drain_guarded(vec![new_id.clone()]).await.is_err() {
                        unrestored += 1;
                    }
                }
                Err(e) => {
                    error!(
                        tier = %self.tier(),
                        instance = %new_id,
                        revision = %old_revision.artifact,
                        reason = %e,
                        "could not restore previous revision"
                    );
                    unrestored += 1;
                }
            }
        }

        if unrestored > 0 {
            let reason = format!("{reason}; rollback left {unrestored} instance(s) on the new revision");
            return self.finish(PlanStatus::Failed, Some(reason));
        }
        self.finish(PlanStatus::RolledBack, Some(reason))
    }

    fn finish(&mut self, status: PlanStatus, reason: Option<String>) -> DeploymentPlan {
        self.plan.finish(status, reason.clone());
        self.ctrl.inner.state.send_replace(ControllerState::Finished {
            plan_id: self.plan.id.clone(),
            status,
            reason: reason.clone(),
        });
        self.emit(DeployEventKind::PlanFinished { status, reason });

        match status {
            PlanStatus::Succeeded => info!(
                tier = %self.tier(),
                plan = %self.plan.id,
                waves = self.plan.waves_completed,
                "plan succeeded"
            ),
            _ => warn!(
                tier = %self.tier(),
                plan = %self.plan.id,
                ?status,
                reason = self.plan.reason.as_deref().unwrap_or(""),
                "plan ended"
            ),
        }
        self.plan.clone()
    }
}
