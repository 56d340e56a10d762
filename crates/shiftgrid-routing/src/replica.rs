//! Datastore primary/replica routing.
//!
//! Roles are not stored as flags on the nodes. They are a fold over an
//! append-only role history: the primary is whichever node the most recent
//! `Bootstrap` or `Promoted` event names. When a state store is configured
//! the history is persisted and replayed on restart, so a promoted replica
//! keeps the role across daemon restarts.
//!
//! Failover: once the primary has been unhealthy for longer than the
//! confirmation window, the healthy replica with the lowest lag (ties by
//! lowest id) is promoted and the former primary is demoted. A recovered
//! former primary stays a replica.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use shiftgrid_core::signal::cancelled;
use shiftgrid_core::{DatastoreConfig, NodeRoleConfig, epoch_secs};
use shiftgrid_health::{HealthEvent, HealthRegistry};
use shiftgrid_state::{
    DatastoreNode, HealthStatus, NodeId, NodeRole, PromotionTrigger, RoleChange, RoleEvent,
    StateStore,
};

use crate::balancer::RoundRobinBalancer;
use crate::error::{ReplicaError, ReplicaResult};

struct NodeEntry {
    address: String,
    lag: u64,
}

struct ReplicaInner {
    nodes: BTreeMap<NodeId, NodeEntry>,
    history: Vec<RoleEvent>,
    /// When the current primary was first seen unhealthy.
    unhealthy_since: Option<Instant>,
    /// A promotion is owed but no replica was healthy.
    fenced: bool,
}

impl ReplicaInner {
    fn primary(&self) -> Option<&NodeId> {
        self.history
            .iter()
            .rev()
            .find(|e| matches!(e.change, RoleChange::Bootstrap | RoleChange::Promoted { .. }))
            .map(|e| &e.node)
    }
}

/// Routes datastore reads and writes.
pub struct ReplicaRouter {
    registry: HealthRegistry,
    window: Duration,
    store: Option<StateStore>,
    inner: Mutex<ReplicaInner>,
    balancer: RoundRobinBalancer,
}

impl ReplicaRouter {
    /// Build the router from configuration, replaying the persisted role
    /// history if the store has one.
    pub fn new(
        config: &DatastoreConfig,
        registry: HealthRegistry,
        store: Option<StateStore>,
    ) -> ReplicaResult<Self> {
        let nodes: BTreeMap<NodeId, NodeEntry> = config
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeEntry {
                        address: n.address.clone(),
                        lag: n.lag,
                    },
                )
            })
            .collect();

        let mut history = match &store {
            Some(store) => store.list_role_events()?,
            None => Vec::new(),
        };

        if history.is_empty() {
            let primary = config
                .nodes
                .iter()
                .find(|n| n.role == NodeRoleConfig::Primary)
                .ok_or_else(|| ReplicaError::Topology("no primary configured".into()))?;
            let event = RoleEvent {
                seq: 0,
                node: primary.id.clone(),
                change: RoleChange::Bootstrap,
                at: epoch_secs(),
            };
            if let Some(store) = &store {
                store.append_role_event(&event)?;
            }
            history.push(event);
        } else {
            info!(events = history.len(), "replayed datastore role history");
        }

        let inner = ReplicaInner {
            nodes,
            history,
            unhealthy_since: None,
            fenced: false,
        };
        match inner.primary() {
            Some(primary) if inner.nodes.contains_key(primary) => {
                info!(primary = %primary, window = ?config.confirmation_window, "replica router ready");
            }
            Some(primary) => {
                return Err(ReplicaError::Topology(format!(
                    "role history names primary {primary}, which is not configured"
                )));
            }
            None => return Err(ReplicaError::Topology("role history has no primary".into())),
        }

        Ok(Self {
            registry,
            window: config.confirmation_window,
            store,
            inner: Mutex::new(inner),
            balancer: RoundRobinBalancer::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReplicaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self, node: &str) -> HealthStatus {
        self.registry.status(node)
    }

    /// Current primary.
    pub fn primary(&self) -> NodeId {
        self.lock().primary().cloned().unwrap_or_default()
    }

    pub fn confirmation_window(&self) -> Duration {
        self.window
    }

    /// Node to send writes to.
    ///
    /// Fails with `PrimaryUnreachable` while the primary is not confirmed
    /// healthy and not yet replaced, and with `NoHealthyReplica` once a
    /// promotion is owed but nothing can take over.
    pub fn write_target(&self) -> ReplicaResult<NodeId> {
        let mut inner = self.lock();
        self.evaluate_locked(&mut inner, Instant::now());

        let primary = inner.primary().cloned().unwrap_or_default();
        if self.status(&primary) == HealthStatus::Healthy {
            return Ok(primary);
        }
        if inner.fenced {
            Err(ReplicaError::NoHealthyReplica)
        } else {
            Err(ReplicaError::PrimaryUnreachable(primary))
        }
    }

    /// Node to send a read to: round-robin over healthy replicas, falling
    /// back to the primary when none is healthy. A primary still `unknown` is
    /// not a fallback.
    pub fn read_target(&self) -> ReplicaResult<NodeId> {
        let healthy: Vec<NodeId> = self
            .ranked_replicas()
            .into_iter()
            .filter(|n| n.health == HealthStatus::Healthy)
            .map(|n| n.id)
            .collect();
        if let Some(node) = self.balancer.pick(&healthy) {
            return Ok(node.clone());
        }

        let primary = self.primary();
        if self.status(&primary) != HealthStatus::Healthy {
            return Err(ReplicaError::NoHealthyReplica);
        }
        Ok(primary)
    }

    fn describe(&self, inner: &ReplicaInner, id: &str, entry: &NodeEntry) -> DatastoreNode {
        let role = if inner.primary().is_some_and(|p| p == id) {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        };
        DatastoreNode {
            id: id.to_string(),
            address: entry.address.clone(),
            role,
            lag: entry.lag,
            health: self.status(id),
        }
    }

    /// Every node with its current role and health.
    pub fn nodes(&self) -> Vec<DatastoreNode> {
        let inner = self.lock();
        inner
            .nodes
            .iter()
            .map(|(id, entry)| self.describe(&inner, id, entry))
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<DatastoreNode> {
        let inner = self.lock();
        inner
            .nodes
            .get(id)
            .map(|entry| self.describe(&inner, id, entry))
    }

    /// Replicas ordered by ascending lag, ties by lowest id.
    pub fn ranked_replicas(&self) -> Vec<DatastoreNode> {
        let mut replicas: Vec<DatastoreNode> = self
            .nodes()
            .into_iter()
            .filter(|n| n.role == NodeRole::Replica)
            .collect();
        replicas.sort_by(|a, b| a.lag.cmp(&b.lag).then_with(|| a.id.cmp(&b.id)));
        replicas
    }

    /// Update a node's replication-lag estimate.
    pub fn report_lag(&self, node: &str, lag: u64) -> ReplicaResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| ReplicaError::UnknownNode(node.to_string()))?;
        entry.lag = lag;
        Ok(())
    }

    /// The full role history, oldest first.
    pub fn history(&self) -> Vec<RoleEvent> {
        self.lock().history.clone()
    }

    /// Operator override: make a healthy replica the primary now.
    pub fn promote(&self, node: &str) -> ReplicaResult<RoleEvent> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(node) {
            return Err(ReplicaError::UnknownNode(node.to_string()));
        }
        if inner.primary().is_some_and(|p| p == node) {
            return Err(ReplicaError::AlreadyPrimary(node.to_string()));
        }
        if self.status(node) != HealthStatus::Healthy {
            return Err(ReplicaError::NotHealthy(node.to_string()));
        }
        Ok(self.promote_locked(&mut inner, node, PromotionTrigger::Manual))
    }

    /// Check the primary and fail over if the confirmation window elapsed.
    ///
    /// Returns the newly promoted node, if any.
    pub fn evaluate(&self) -> Option<NodeId> {
        let mut inner = self.lock();
        self.evaluate_locked(&mut inner, Instant::now())
    }

    fn evaluate_locked(&self, inner: &mut ReplicaInner, now: Instant) -> Option<NodeId> {
        let primary = inner.primary().cloned()?;
        if self.status(&primary) != HealthStatus::Unhealthy {
            if inner.unhealthy_since.take().is_some() {
                info!(primary = %primary, "primary recovered before failover");
            }
            inner.fenced = false;
            return None;
        }

        let since = *inner.unhealthy_since.get_or_insert_with(|| {
            warn!(primary = %primary, window = ?self.window, "primary unhealthy, confirming");
            now
        });
        if now.duration_since(since) < self.window {
            return None;
        }

        let candidate = inner
            .nodes
            .iter()
            .filter(|(id, _)| **id != primary && self.status(id) == HealthStatus::Healthy)
            .min_by(|(a_id, a), (b_id, b)| a.lag.cmp(&b.lag).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone());

        match candidate {
            Some(node) => {
                self.promote_locked(inner, &node, PromotionTrigger::Failover);
                Some(node)
            }
            None => {
                if !inner.fenced {
                    error!(primary = %primary, "failover owed but no healthy replica; writes fenced");
                }
                inner.fenced = true;
                None
            }
        }
    }

    fn append(&self, inner: &mut ReplicaInner, node: &str, change: RoleChange) -> RoleEvent {
        let seq = inner.history.last().map_or(0, |e| e.seq + 1);
        let event = RoleEvent {
            seq,
            node: node.to_string(),
            change,
            at: epoch_secs(),
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.append_role_event(&event) {
                error!(seq, node = %node, error = %e, "failed to persist role event");
            }
        }
        inner.history.push(event.clone());
        event
    }

    fn promote_locked(
        &self,
        inner: &mut ReplicaInner,
        node: &str,
        trigger: PromotionTrigger,
    ) -> RoleEvent {
        let previous = inner.primary().cloned();
        let promoted = self.append(
            inner,
            node,
            RoleChange::Promoted {
                previous: previous.clone(),
                trigger,
            },
        );
        if let Some(previous) = &previous {
            self.append(inner, previous, RoleChange::Demoted);
        }
        inner.unhealthy_since = None;
        inner.fenced = false;

        info!(
            primary = %node,
            previous = previous.as_deref().unwrap_or("-"),
            ?trigger,
            "datastore primary promoted"
        );
        promoted
    }

    fn deadline(&self) -> Option<Instant> {
        let inner = self.lock();
        if inner.fenced {
            return None;
        }
        inner.unhealthy_since.map(|since| since + self.window)
    }

    /// Re-evaluate on every health event for a datastore node and when the
    /// confirmation window expires, until shutdown.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("replica router started");
        self.evaluate();
        loop {
            let deadline = self.deadline();
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = expiry => {
                    self.evaluate();
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        let relevant = self.lock().nodes.contains_key(event.entity());
                        if relevant {
                            self.evaluate();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.evaluate();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("replica router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shiftgrid_core::NodeConfig;
    use shiftgrid_health::{ProbeResult, ProbeSettings};

    const WINDOW: Duration = Duration::from_secs(30);

    fn registry() -> HealthRegistry {
        HealthRegistry::new(ProbeSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            success_threshold: 2,
            failure_threshold: 3,
        })
    }

    fn node(id: &str, role: NodeRoleConfig, lag: u64) -> NodeConfig {
        NodeConfig {
            id: id.to_string(),
            address: format!("{id}.db.local:5432"),
            role,
            lag,
        }
    }

    /// Primary db-1, replicas at lag 2, 5 and 1.
    fn config() -> DatastoreConfig {
        DatastoreConfig {
            confirmation_window: WINDOW,
            nodes: vec![
                node("db-1", NodeRoleConfig::Primary, 0),
                node("db-2", NodeRoleConfig::Replica, 2),
                node("db-3", NodeRoleConfig::Replica, 5),
                node("db-4", NodeRoleConfig::Replica, 1),
            ],
        }
    }

    fn feed(registry: &HealthRegistry, id: &str, result: ProbeResult, times: usize) {
        for _ in 0..times {
            registry.record(id, result);
        }
    }

    fn all_healthy(registry: &HealthRegistry) {
        for id in ["db-1", "db-2", "db-3", "db-4"] {
            registry.track(id);
            feed(registry, id, ProbeResult::Success, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failover_promotes_lowest_lag_replica() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();
        assert_eq!(router.write_target().unwrap(), "db-1");

        feed(&registry, "db-1", ProbeResult::Failure, 5);
        assert!(matches!(
            router.write_target(),
            Err(ReplicaError::PrimaryUnreachable(ref p)) if p == "db-1"
        ));

        tokio::time::advance(WINDOW).await;
        assert_eq!(router.write_target().unwrap(), "db-4");
        assert_eq!(router.primary(), "db-4");

        // The former primary recovers but stays a replica.
        feed(&registry, "db-1", ProbeResult::Success, 2);
        assert_eq!(router.write_target().unwrap(), "db-4");
        assert_eq!(router.node("db-1").unwrap().role, NodeRole::Replica);

        let primaries = router
            .nodes()
            .into_iter()
            .filter(|n| n.role == NodeRole::Primary)
            .count();
        assert_eq!(primaries, 1);

        let history = router.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].node, "db-4");
        assert_eq!(
            history[1].change,
            RoleChange::Promoted {
                previous: Some("db-1".into()),
                trigger: PromotionTrigger::Failover,
            }
        );
        assert_eq!(history[2].node, "db-1");
        assert_eq!(history[2].change, RoleChange::Demoted);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_inside_window_keeps_primary() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();

        feed(&registry, "db-1", ProbeResult::Failure, 3);
        assert!(router.evaluate().is_none());
        tokio::time::advance(WINDOW / 2).await;
        feed(&registry, "db-1", ProbeResult::Success, 2);
        tokio::time::advance(WINDOW).await;

        assert!(router.evaluate().is_none());
        assert_eq!(router.write_target().unwrap(), "db-1");
        assert_eq!(router.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lag_ties_break_on_lowest_id() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();
        router.report_lag("db-2", 1).unwrap();

        feed(&registry, "db-1", ProbeResult::Failure, 3);
        router.evaluate();
        tokio::time::advance(WINDOW).await;
        assert_eq!(router.evaluate().as_deref(), Some("db-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_healthy_replica_fences_writes() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();
        for id in ["db-1", "db-2", "db-3", "db-4"] {
            feed(&registry, id, ProbeResult::Unreachable, 3);
        }

        router.evaluate();
        tokio::time::advance(WINDOW).await;
        assert!(router.evaluate().is_none());
        assert!(matches!(
            router.write_target(),
            Err(ReplicaError::NoHealthyReplica)
        ));
        assert!(matches!(
            router.read_target(),
            Err(ReplicaError::NoHealthyReplica)
        ));
        assert_eq!(router.primary(), "db-1");
    }

    #[test]
    fn reads_rotate_over_healthy_replicas() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();
        feed(&registry, "db-3", ProbeResult::Failure, 3);

        let picks: Vec<NodeId> = (0..4).map(|_| router.read_target().unwrap()).collect();
        assert_eq!(picks, vec!["db-4", "db-2", "db-4", "db-2"]);
    }

    #[test]
    fn unresolved_primary_is_not_a_target() {
        let registry = registry();
        registry.track("db-1");
        registry.track("db-2");
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();

        assert!(matches!(
            router.write_target(),
            Err(ReplicaError::PrimaryUnreachable(ref p)) if p == "db-1"
        ));
        assert!(matches!(
            router.read_target(),
            Err(ReplicaError::NoHealthyReplica)
        ));

        // Unknown never starts the failover window.
        assert!(router.evaluate().is_none());
        assert_eq!(router.primary(), "db-1");

        feed(&registry, "db-1", ProbeResult::Success, 2);
        assert_eq!(router.write_target().unwrap(), "db-1");
        assert_eq!(router.read_target().unwrap(), "db-1");
    }

    #[test]
    fn reads_fall_back_to_primary() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();
        for id in ["db-2", "db-3", "db-4"] {
            feed(&registry, id, ProbeResult::Failure, 3);
        }
        assert_eq!(router.read_target().unwrap(), "db-1");
    }

    #[test]
    fn manual_promote_requires_healthy_replica() {
        let registry = registry();
        all_healthy(&registry);
        let router = ReplicaRouter::new(&config(), registry.clone(), None).unwrap();

        assert!(matches!(
            router.promote("db-1"),
            Err(ReplicaError::AlreadyPrimary(_))
        ));
        assert!(matches!(
            router.promote("db-9"),
            Err(ReplicaError::UnknownNode(_))
        ));
        feed(&registry, "db-3", ProbeResult::Failure, 3);
        assert!(matches!(
            router.promote("db-3"),
            Err(ReplicaError::NotHealthy(_))
        ));

        let event = router.promote("db-2").unwrap();
        assert_eq!(
            event.change,
            RoleChange::Promoted {
                previous: Some("db-1".into()),
                trigger: PromotionTrigger::Manual,
            }
        );
        assert_eq!(router.write_target().unwrap(), "db-2");
    }

    #[test]
    fn role_history_survives_restart() {
        let store = StateStore::open_in_memory().unwrap();
        let registry = registry();
        all_healthy(&registry);

        let router = ReplicaRouter::new(&config(), registry.clone(), Some(store.clone())).unwrap();
        router.promote("db-3").unwrap();
        drop(router);

        let restarted = ReplicaRouter::new(&config(), registry, Some(store)).unwrap();
        assert_eq!(restarted.primary(), "db-3");
        assert_eq!(restarted.history().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_fails_over_after_window() {
        let registry = registry();
        all_healthy(&registry);
        let router = Arc::new(ReplicaRouter::new(&config(), registry.clone(), None).unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let router = Arc::clone(&router);
            let events = registry.subscribe();
            tokio::spawn(async move { router.run(events, shutdown_rx).await })
        };
        tokio::task::yield_now().await;

        feed(&registry, "db-1", ProbeResult::Failure, 3);
        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(router.primary(), "db-4");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
