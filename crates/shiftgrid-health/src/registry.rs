//! Health registry: per-entity probe loops and the state-change feed.
//!
//! The `HealthRegistry` spawns one background task per monitored entity
//! that probes it on a fixed interval and records the result in that
//! entity's `HealthTracker`. Status flips are published on a broadcast
//! feed consumed by the traffic router, the replica router and the
//! deployment controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shiftgrid_core::epoch_millis;
use shiftgrid_core::signal::cancelled;
use shiftgrid_state::{EntityId, HealthState, HealthStatus};

use crate::checker::{HealthTracker, Probe, ProbeResult, ProbeSettings};

const EVENT_CAPACITY: usize = 1024;

/// A change published on the registry feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// An entity's status flipped.
    Changed {
        entity: EntityId,
        previous: HealthStatus,
        current: HealthStatus,
        state: HealthState,
    },
    /// An entity was removed; its state is gone.
    Removed { entity: EntityId },
}

impl HealthEvent {
    pub fn entity(&self) -> &str {
        match self {
            HealthEvent::Changed { entity, .. } | HealthEvent::Removed { entity } => entity,
        }
    }
}

/// How a startup wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Healthy,
    Unhealthy,
    TimedOut,
    Cancelled,
    /// The entity was removed while waiting.
    Removed,
}

/// Background probe task for one entity.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

struct Entry {
    tracker: HealthTracker,
    monitor: Option<MonitorSlot>,
}

struct RegistryInner {
    settings: ProbeSettings,
    entries: Mutex<HashMap<EntityId, Entry>>,
    events: broadcast::Sender<HealthEvent>,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<EntityId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, entity: &str, result: ProbeResult) -> Option<HealthEvent> {
        let event = {
            let mut entries = self.entries();
            let entry = entries.get_mut(entity)?;
            let previous = entry.tracker.status();
            let current = entry.tracker.record(result, epoch_millis());
            (previous != current).then(|| HealthEvent::Changed {
                entity: entity.to_string(),
                previous,
                current,
                state: entry.tracker.state().clone(),
            })
        };

        if let Some(event) = &event {
            debug!(%entity, ?event, "health status changed");
            let _ = self.events.send(event.clone());
        }
        event
    }
}

/// Tracks liveness of every instance slot and datastore node.
///
/// Cheap to clone; clones share the same entities and feed.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RegistryInner>,
}

impl HealthRegistry {
    /// Create an empty registry.
    pub fn new(settings: ProbeSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.inner.settings
    }

    /// Start tracking an entity in the `Unknown` state without probing it.
    ///
    /// Results are fed through [`HealthRegistry::record`]. Returns false if
    /// the entity was already tracked.
    pub fn track(&self, entity: &str) -> bool {
        let mut entries = self.inner.entries();
        if entries.contains_key(entity) {
            return false;
        }
        entries.insert(
            entity.to_string(),
            Entry {
                tracker: HealthTracker::from_settings(&self.inner.settings),
                monitor: None,
            },
        );
        true
    }

    /// Start probing an entity on the configured interval.
    ///
    /// A new entity starts `Unknown`. Registering an entity that is already
    /// monitored replaces its probe but keeps its health record.
    pub fn register(&self, entity: &str, probe: Arc<dyn Probe>) {
        let target = probe.target();
        let settings = self.inner.settings;

        // The entry must exist before the loop's first tick looks it up.
        let previous = {
            let mut entries = self.inner.entries();
            let entry = entries.entry(entity.to_string()).or_insert_with(|| Entry {
                tracker: HealthTracker::from_settings(&settings),
                monitor: None,
            });

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let weak = Arc::downgrade(&self.inner);
            let entity_owned = entity.to_string();
            let handle = tokio::spawn(async move {
                run_probe_loop(weak, entity_owned, probe, settings, shutdown_rx).await;
            });
            entry.monitor.replace(MonitorSlot {
                handle,
                shutdown_tx,
            })
        };
        if let Some(old) = previous {
            old.stop();
        }

        info!(%entity, %target, "health monitor started");
    }

    /// Record one probe result for a tracked entity.
    ///
    /// Returns the published event if the status flipped. Results for
    /// unknown entities are ignored.
    pub fn record(&self, entity: &str, result: ProbeResult) -> Option<HealthEvent> {
        self.inner.record(entity, result)
    }

    /// Last known health of an entity (non-blocking).
    pub fn query(&self, entity: &str) -> Option<HealthState> {
        self.inner
            .entries()
            .get(entity)
            .map(|e| e.tracker.state().clone())
    }

    /// Last known status; `Unknown` for untracked entities.
    pub fn status(&self, entity: &str) -> HealthStatus {
        self.inner
            .entries()
            .get(entity)
            .map(|e| e.tracker.status())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Health of every tracked entity.
    pub fn snapshot(&self) -> BTreeMap<EntityId, HealthState> {
        self.inner
            .entries()
            .iter()
            .map(|(id, e)| (id.clone(), e.tracker.state().clone()))
            .collect()
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Stop probing an entity and discard its state. Returns true if it existed.
    pub fn remove(&self, entity: &str) -> bool {
        let removed = self.inner.entries().remove(entity);
        match removed {
            Some(entry) => {
                if let Some(monitor) = entry.monitor {
                    monitor.stop();
                }
                let _ = self.inner.events.send(HealthEvent::Removed {
                    entity: entity.to_string(),
                });
                info!(%entity, "health monitor removed");
                true
            }
            None => false,
        }
    }

    /// Whether an entity has a running probe loop.
    pub fn is_monitoring(&self, entity: &str) -> bool {
        self.inner
            .entries()
            .get(entity)
            .is_some_and(|e| e.monitor.is_some())
    }

    /// Stop all probe loops (for graceful shutdown). Health records are kept.
    pub fn stop_all(&self) {
        let monitors: Vec<MonitorSlot> = self
            .inner
            .entries()
            .values_mut()
            .filter_map(|e| e.monitor.take())
            .collect();
        let count = monitors.len();
        for monitor in monitors {
            monitor.stop();
        }
        info!(count, "all health monitors stopped");
    }

    /// Wait until an entity resolves to healthy or unhealthy.
    ///
    /// Gives up when `timeout` elapses or `cancel` is raised.
    pub async fn wait_for_resolution(
        &self,
        entity: &str,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Resolution {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.query(entity).map(|s| s.status) {
                None => return Resolution::Removed,
                Some(HealthStatus::Healthy) => return Resolution::Healthy,
                Some(HealthStatus::Unhealthy) => return Resolution::Unhealthy,
                Some(HealthStatus::Unknown) => {}
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Resolution::TimedOut,
                _ = cancelled(cancel) => return Resolution::Cancelled,
                event = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        return Resolution::Removed;
                    }
                }
            }
        }
    }
}

/// The probe loop for a single entity.
async fn run_probe_loop(
    registry: Weak<RegistryInner>,
    entity: EntityId,
    probe: Arc<dyn Probe>,
    settings: ProbeSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(%entity, "probe loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = tokio::time::timeout(settings.timeout, probe.check())
                    .await
                    .unwrap_or(ProbeResult::Unreachable);

                let Some(inner) = registry.upgrade() else {
                    break;
                };
                if !inner.entries().contains_key(&entity) {
                    warn!(%entity, "probe loop outlived its entity");
                    break;
                }
                inner.record(&entity, result);
            }
            _ = cancelled(&mut shutdown) => {
                debug!(%entity, "probe loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    fn settings() -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            success_threshold: 2,
            failure_threshold: 3,
        }
    }

    #[test]
    fn record_ignores_untracked_entities() {
        let registry = HealthRegistry::new(settings());
        assert!(registry.record("ghost", ProbeResult::Success).is_none());
        assert!(registry.query("ghost").is_none());
        assert_eq!(registry.status("ghost"), HealthStatus::Unknown);
    }

    #[test]
    fn record_publishes_only_flips() {
        let registry = HealthRegistry::new(settings());
        let mut feed = registry.subscribe();
        registry.track("web-1");

        assert!(registry.record("web-1", ProbeResult::Success).is_none());
        let event = registry.record("web-1", ProbeResult::Success).unwrap();
        assert!(matches!(
            event,
            HealthEvent::Changed {
                previous: HealthStatus::Unknown,
                current: HealthStatus::Healthy,
                ..
            }
        ));
        assert!(registry.record("web-1", ProbeResult::Success).is_none());

        assert_eq!(feed.try_recv().unwrap(), event);
        assert!(feed.try_recv().is_err());
    }

    #[test]
    fn query_returns_counters() {
        let registry = HealthRegistry::new(settings());
        registry.track("db-1");
        registry.record("db-1", ProbeResult::Failure);
        registry.record("db-1", ProbeResult::Unreachable);

        let state = registry.query("db-1").unwrap();
        assert_eq!(state.status, HealthStatus::Unknown);
        assert_eq!(state.consecutive_failures, 2);
        assert!(state.last_probe_at.is_some());
    }

    #[test]
    fn remove_discards_state_and_notifies() {
        let registry = HealthRegistry::new(settings());
        let mut feed = registry.subscribe();
        registry.track("web-1");

        assert!(registry.remove("web-1"));
        assert!(!registry.remove("web-1"));
        assert!(registry.query("web-1").is_none());
        assert_eq!(
            feed.try_recv().unwrap(),
            HealthEvent::Removed {
                entity: "web-1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_drives_hysteresis() {
        let registry = HealthRegistry::new(settings());
        registry.register("web-1", Arc::new(ScriptedProbe::always(ProbeResult::Success)));
        assert!(registry.is_monitoring("web-1"));

        let outcome = registry
            .wait_for_resolution("web-1", Duration::from_secs(10), &mut shiftgrid_core::signal::never())
            .await;
        assert_eq!(outcome, Resolution::Healthy);
        assert!(registry.query("web-1").unwrap().consecutive_successes >= 2);

        registry.stop_all();
        assert!(!registry.is_monitoring("web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_unhealthy_for_failing_probe() {
        let registry = HealthRegistry::new(settings());
        registry.register("web-2", Arc::new(ScriptedProbe::always(ProbeResult::Failure)));

        let outcome = registry
            .wait_for_resolution("web-2", Duration::from_secs(30), &mut shiftgrid_core::signal::never())
            .await;
        assert_eq!(outcome, Resolution::Unhealthy);
        registry.remove("web-2");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_while_unknown() {
        let registry = HealthRegistry::new(settings());
        registry.track("web-3");

        let outcome = registry
            .wait_for_resolution("web-3", Duration::from_secs(5), &mut shiftgrid_core::signal::never())
            .await;
        assert_eq!(outcome, Resolution::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_honours_cancellation() {
        let registry = HealthRegistry::new(settings());
        registry.track("web-4");
        let (tx, mut rx) = watch::channel(false);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_resolution("web-4", Duration::from_secs(60), &mut rx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), Resolution::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeouts_count_as_failures() {
        let registry = HealthRegistry::new(settings());
        // Each check takes longer than the 500ms probe timeout.
        let probe = ScriptedProbe::always(ProbeResult::Success).with_delay(Duration::from_secs(2));
        registry.register("slow-1", Arc::new(probe));

        let outcome = registry
            .wait_for_resolution("slow-1", Duration::from_secs(60), &mut shiftgrid_core::signal::never())
            .await;
        assert_eq!(outcome, Resolution::Unhealthy);
        registry.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn register_replaces_existing_monitor() {
        let registry = HealthRegistry::new(settings());
        registry.register("web-5", Arc::new(ScriptedProbe::always(ProbeResult::Failure)));
        registry.register("web-5", Arc::new(ScriptedProbe::always(ProbeResult::Success)));

        let outcome = registry
            .wait_for_resolution("web-5", Duration::from_secs(30), &mut shiftgrid_core::signal::never())
            .await;
        assert_eq!(outcome, Resolution::Healthy);
        assert_eq!(registry.snapshot().len(), 1);
        registry.stop_all();
    }
}
