//! Per-tier traffic routing.
//!
//! The routing table of a tier is derived, never stored: it is the set of
//! slots whose lifecycle is `Active` and whose health is `Healthy`. Every
//! read recomputes it under the router lock from the live health registry,
//! so a slot that just turned unhealthy is never handed out, even before
//! the registry event reaches the router loop.
//!
//! Lifecycle changes that shrink the table (draining, removal) go through
//! the same lock and refuse to take the table below a caller-supplied
//! floor, or below one member while it has any.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use shiftgrid_core::signal::cancelled;
use shiftgrid_health::{HealthEvent, HealthRegistry};
use shiftgrid_state::{HealthStatus, InstanceId, Lifecycle, RoutingTable, TierId};

use crate::balancer::RoundRobinBalancer;
use crate::error::{RoutingError, RoutingResult};

/// Outcome of a guarded removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    /// Removing now would empty the table. The removal is deferred until
    /// another slot becomes eligible.
    Unsafe,
}

/// Which slots `begin_drain` moved to draining and which it held back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainDecision {
    pub draining: Vec<InstanceId>,
    pub held: Vec<InstanceId>,
}

struct RouterInner {
    slots: BTreeMap<InstanceId, Lifecycle>,
    deferred: BTreeSet<InstanceId>,
    published: BTreeSet<InstanceId>,
    generation: u64,
}

/// Owns the routing table of one tier.
pub struct TrafficRouter {
    tier: TierId,
    registry: HealthRegistry,
    inner: Mutex<RouterInner>,
    table_tx: watch::Sender<RoutingTable>,
    balancer: RoundRobinBalancer,
}

impl TrafficRouter {
    pub fn new(tier: &str, registry: HealthRegistry) -> Self {
        let (table_tx, _) = watch::channel(RoutingTable::new(tier));
        Self {
            tier: tier.to_string(),
            registry,
            inner: Mutex::new(RouterInner {
                slots: BTreeMap::new(),
                deferred: BTreeSet::new(),
                published: BTreeSet::new(),
                generation: 0,
            }),
            table_tx,
            balancer: RoundRobinBalancer::new(),
        }
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn eligible(&self, inner: &RouterInner) -> BTreeSet<InstanceId> {
        inner
            .slots
            .iter()
            .filter(|(id, lifecycle)| {
                **lifecycle == Lifecycle::Active
                    && self.registry.status(id) == HealthStatus::Healthy
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply deferred removals that became safe, then publish the table if
    /// its membership changed.
    fn recompute(&self, inner: &mut RouterInner) -> RoutingTable {
        let mut members = self.eligible(inner);

        if !inner.deferred.is_empty() {
            let deferred: Vec<InstanceId> = inner.deferred.iter().cloned().collect();
            for id in deferred {
                let remaining = members.iter().filter(|m| **m != id).count();
                if remaining > 0 || !members.contains(&id) {
                    inner.deferred.remove(&id);
                    inner.slots.remove(&id);
                    members.remove(&id);
                    info!(tier = %self.tier, instance = %id, "deferred removal applied");
                }
            }
        }

        if members != inner.published {
            inner.generation += 1;
            inner.published = members.clone();
            debug!(
                tier = %self.tier,
                generation = inner.generation,
                members = members.len(),
                "routing table changed"
            );
            if members.is_empty() && !inner.slots.is_empty() {
                warn!(tier = %self.tier, "routing table is empty");
            }
        }

        let table = RoutingTable {
            tier: self.tier.clone(),
            members,
            generation: inner.generation,
        };
        self.table_tx.send_if_modified(|current| {
            if current.generation == table.generation {
                return false;
            }
            *current = table.clone();
            true
        });
        table
    }

    /// Start tracking a slot in the given lifecycle phase.
    pub fn track(&self, id: &str, lifecycle: Lifecycle) {
        let mut inner = self.lock();
        inner.slots.insert(id.to_string(), lifecycle);
        self.recompute(&mut inner);
    }

    /// Change a slot's lifecycle phase.
    pub fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) -> RoutingResult<()> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(id)
            .ok_or_else(|| RoutingError::UnknownInstance {
                tier: self.tier.clone(),
                instance: id.to_string(),
            })?;
        *slot = lifecycle;
        self.recompute(&mut inner);
        Ok(())
    }

    /// Drop a slot unconditionally. Returns true if it was tracked.
    pub fn forget(&self, id: &str) -> bool {
        let mut inner = self.lock();
        inner.deferred.remove(id);
        let existed = inner.slots.remove(id).is_some();
        self.recompute(&mut inner);
        existed
    }

    /// Remove a slot unless it is the last eligible member.
    pub fn retire(&self, id: &str) -> RoutingResult<RemovalOutcome> {
        let mut inner = self.lock();
        if !inner.slots.contains_key(id) {
            return Err(RoutingError::UnknownInstance {
                tier: self.tier.clone(),
                instance: id.to_string(),
            });
        }

        let members = self.eligible(&inner);
        if members.len() == 1 && members.contains(id) {
            inner.deferred.insert(id.to_string());
            warn!(tier = %self.tier, instance = %id, "removal deferred: last eligible instance");
            return Ok(RemovalOutcome::Unsafe);
        }

        inner.slots.remove(id);
        self.recompute(&mut inner);
        Ok(RemovalOutcome::Removed)
    }

    /// Move slots to `Draining` while the table keeps at least `floor`
    /// members (and at least one while it has any).
    ///
    /// Slots that are not currently eligible are drained first since they
    /// do not count toward the floor. Unknown ids are ignored.
    pub fn begin_drain(&self, ids: &[InstanceId], floor: usize) -> DrainDecision {
        let mut inner = self.lock();
        let members = self.eligible(&inner);
        let floor = if members.is_empty() { 0 } else { floor.max(1) };
        let mut remaining = members.len();
        let mut decision = DrainDecision::default();

        let (eligible, ineligible): (Vec<&InstanceId>, Vec<&InstanceId>) =
            ids.iter().partition(|id| members.contains(*id));

        for id in ineligible {
            if let Some(slot) = inner.slots.get_mut(id) {
                *slot = Lifecycle::Draining;
                decision.draining.push(id.clone());
            }
        }
        for id in eligible {
            if remaining > floor {
                if let Some(slot) = inner.slots.get_mut(id) {
                    *slot = Lifecycle::Draining;
                    remaining -= 1;
                    decision.draining.push(id.clone());
                }
            } else {
                decision.held.push(id.clone());
            }
        }

        if !decision.held.is_empty() {
            debug!(
                tier = %self.tier,
                held = decision.held.len(),
                floor,
                "drain held back by availability floor"
            );
        }
        self.recompute(&mut inner);
        decision
    }

    /// Current eligible set, derived from live health.
    pub fn current_set(&self) -> BTreeSet<InstanceId> {
        self.table().members
    }

    /// Current routing table, derived from live health.
    pub fn table(&self) -> RoutingTable {
        let mut inner = self.lock();
        self.recompute(&mut inner)
    }

    /// Lifecycle of every tracked slot.
    pub fn slots(&self) -> BTreeMap<InstanceId, Lifecycle> {
        self.lock().slots.clone()
    }

    pub fn lifecycle(&self, id: &str) -> Option<Lifecycle> {
        self.lock().slots.get(id).copied()
    }

    /// Recompute after an external change.
    pub fn refresh(&self) -> RoutingTable {
        self.table()
    }

    /// Receive every published table generation.
    pub fn subscribe(&self) -> watch::Receiver<RoutingTable> {
        self.table_tx.subscribe()
    }

    /// Next instance to send a request to, round-robin over the eligible set.
    pub fn next_backend(&self) -> Option<InstanceId> {
        let members: Vec<InstanceId> = self.current_set().into_iter().collect();
        self.balancer.pick(&members).cloned()
    }

    /// Wait until the table holds at least `min` members.
    ///
    /// Dropping the returned future cancels the wait.
    pub async fn await_min(&self, min: usize, timeout: Duration) -> RoutingResult<RoutingTable> {
        let mut tables = self.subscribe();
        let mut health = self.registry.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let table = self.table();
            if table.len() >= min {
                return Ok(table);
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RoutingError::Timeout {
                        tier: self.tier.clone(),
                        wanted: min,
                        have: self.table().len(),
                    });
                }
                _ = tables.changed() => {}
                _ = health.recv() => {}
            }
        }
    }

    /// Recompute on every health event for one of this tier's slots until
    /// shutdown.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(tier = %self.tier, "traffic router started");
        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let tracked = self.lock().slots.contains_key(event.entity());
                        if tracked {
                            self.refresh();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(tier = %self.tier, skipped, "health feed lagged, recomputing");
                        self.refresh();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!(tier = %self.tier, "traffic router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shiftgrid_health::{ProbeResult, ProbeSettings};

    fn registry() -> HealthRegistry {
        HealthRegistry::new(ProbeSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            success_threshold: 1,
            failure_threshold: 1,
        })
    }

    fn healthy(registry: &HealthRegistry, id: &str) {
        registry.track(id);
        registry.record(id, ProbeResult::Success);
    }

    fn router_with(registry: &HealthRegistry, ids: &[&str]) -> TrafficRouter {
        let router = TrafficRouter::new("web", registry.clone());
        for id in ids {
            healthy(registry, id);
            router.track(id, Lifecycle::Active);
        }
        router
    }

    #[test]
    fn table_requires_active_and_healthy() {
        let registry = registry();
        let router = router_with(&registry, &["web-1", "web-2"]);

        registry.track("web-3");
        router.track("web-3", Lifecycle::Active); // unknown health
        healthy(&registry, "web-4");
        router.track("web-4", Lifecycle::Starting);

        let set = router.current_set();
        assert_eq!(set.len(), 2);
        assert!(set.contains("web-1") && set.contains("web-2"));
    }

    #[test]
    fn reads_reflect_health_without_refresh() {
        let registry = registry();
        let router = router_with(&registry, &["web-1", "web-2"]);

        registry.record("web-1", ProbeResult::Failure);
        assert!(!router.current_set().contains("web-1"));
        for _ in 0..4 {
            assert_eq!(router.next_backend().as_deref(), Some("web-2"));
        }
    }

    #[test]
    fn generation_bumps_only_on_change() {
        let registry = registry();
        let router = router_with(&registry, &["web-1"]);
        let first = router.table().generation;
        assert_eq!(router.table().generation, first);

        healthy(&registry, "web-2");
        router.track("web-2", Lifecycle::Active);
        assert_eq!(router.table().generation, first + 1);
    }

    #[test]
    fn retire_defers_last_member() {
        let registry = registry();
        let router = router_with(&registry, &["web-1"]);

        assert_eq!(router.retire("web-1").unwrap(), RemovalOutcome::Unsafe);
        assert!(router.current_set().contains("web-1"));

        // A replacement becomes eligible; the deferred removal goes through.
        healthy(&registry, "web-2");
        router.track("web-2", Lifecycle::Active);
        let set = router.current_set();
        assert_eq!(set.len(), 1);
        assert!(set.contains("web-2"));
        assert!(router.lifecycle("web-1").is_none());
    }

    #[test]
    fn retire_unknown_instance_errors() {
        let router = router_with(&registry(), &[]);
        assert!(matches!(
            router.retire("ghost"),
            Err(RoutingError::UnknownInstance { .. })
        ));
    }

    #[test]
    fn begin_drain_respects_floor() {
        let registry = registry();
        let router = router_with(&registry, &["web-1", "web-2", "web-3"]);

        let ids: Vec<InstanceId> = vec!["web-1".into(), "web-2".into()];
        let decision = router.begin_drain(&ids, 2);
        assert_eq!(decision.draining, vec!["web-1".to_string()]);
        assert_eq!(decision.held, vec!["web-2".to_string()]);
        assert_eq!(router.current_set().len(), 2);
        assert_eq!(router.lifecycle("web-1"), Some(Lifecycle::Draining));
    }

    #[test]
    fn begin_drain_never_empties_table() {
        let registry = registry();
        let router = router_with(&registry, &["web-1", "web-2"]);

        let ids: Vec<InstanceId> = vec!["web-1".into(), "web-2".into()];
        let decision = router.begin_drain(&ids, 0);
        assert_eq!(decision.draining.len(), 1);
        assert_eq!(decision.held.len(), 1);
        assert_eq!(router.current_set().len(), 1);
    }

    #[test]
    fn begin_drain_takes_ineligible_first() {
        let registry = registry();
        let router = router_with(&registry, &["web-1", "web-2"]);
        registry.record("web-2", ProbeResult::Failure);

        let ids: Vec<InstanceId> = vec!["web-1".into(), "web-2".into()];
        let decision = router.begin_drain(&ids, 1);
        assert_eq!(decision.draining, vec!["web-2".to_string()]);
        assert_eq!(decision.held, vec!["web-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn await_min_wakes_on_health_change() {
        let registry = registry();
        let router = Arc::new(router_with(&registry, &["web-1"]));
        registry.track("web-2");
        router.track("web-2", Lifecycle::Active);

        let waiter = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.await_min(2, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.record("web-2", ProbeResult::Success);

        let table = waiter.await.unwrap().unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn await_min_times_out() {
        let registry = registry();
        let router = router_with(&registry, &["web-1"]);

        let err = router.await_min(3, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RoutingError::Timeout { wanted: 3, have: 1, .. }));
    }

    #[tokio::test]
    async fn run_loop_publishes_health_changes() {
        let registry = registry();
        let router = Arc::new(router_with(&registry, &["web-1", "web-2"]));
        let mut tables = router.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let router = Arc::clone(&router);
            let events = registry.subscribe();
            tokio::spawn(async move { router.run(events, shutdown_rx).await })
        };

        registry.record("web-2", ProbeResult::Failure);
        tables.changed().await.unwrap();
        assert_eq!(tables.borrow().members.len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
