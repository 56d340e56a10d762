//! Control plane assembly.
//!
//! Builds every subsystem from a parsed `ShiftgridConfig`:
//! 1. One health registry shared by all tiers and the datastore
//! 2. A traffic router and a deployment controller per tier, adopting the
//!    instances listed in the config
//! 3. The replica router, probing every datastore node over TCP
//! 4. The pipeline controller over the tiers in dependency order
//! 5. The operator REST API
//!
//! Compute is reached through a [`ComputeBackend`] so tests can swap the
//! HTTP agents for in-memory fakes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shiftgrid_api::ApiState;
use shiftgrid_core::{InstanceConfig, NodeConfig, ShiftgridConfig, TierConfig};
use shiftgrid_health::{HealthRegistry, HttpProbe, Probe, ProbeSettings, TcpProbe};
use shiftgrid_pipeline::{PipelineController, RetryPolicy};
use shiftgrid_rollout::{DeploymentController, Provisioner, RollingConfig};
use shiftgrid_routing::{ReplicaRouter, TrafficRouter};
use shiftgrid_state::{InstanceSlot, Lifecycle, Revision, StateStore};

use crate::agent::AgentProvisioner;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Where instances run and how pre-existing ones are probed.
pub trait ComputeBackend {
    fn provisioner(&self, tier: &TierConfig) -> Arc<dyn Provisioner>;

    /// Probe for an instance listed in the config.
    fn instance_probe(&self, tier: &TierConfig, instance: &InstanceConfig) -> Arc<dyn Probe>;

    /// Probe for a datastore node.
    fn node_probe(&self, node: &NodeConfig) -> Arc<dyn Probe>;
}

/// Production backend: per-tier HTTP agents, HTTP probes for instances,
/// TCP probes for datastore nodes.
#[derive(Debug, Clone)]
pub struct AgentBackend {
    pub probe_timeout: Duration,
}

impl ComputeBackend for AgentBackend {
    fn provisioner(&self, tier: &TierConfig) -> Arc<dyn Provisioner> {
        Arc::new(AgentProvisioner::new(
            &tier.agent,
            &tier.health_path,
            self.probe_timeout,
            tier.rollout.startup_timeout,
        ))
    }

    fn instance_probe(&self, tier: &TierConfig, instance: &InstanceConfig) -> Arc<dyn Probe> {
        Arc::new(HttpProbe::new(
            &instance.address,
            &tier.health_path,
            self.probe_timeout,
        ))
    }

    fn node_probe(&self, node: &NodeConfig) -> Arc<dyn Probe> {
        Arc::new(TcpProbe::new(&node.address, self.probe_timeout))
    }
}

/// Every assembled subsystem.
pub struct ControlPlane {
    pub registry: HealthRegistry,
    pub pipeline: PipelineController,
    pub routers: Vec<Arc<TrafficRouter>>,
    pub replica: Option<Arc<ReplicaRouter>>,
}

impl ControlPlane {
    /// Build the control plane. Nothing runs until [`ControlPlane::spawn`],
    /// except the health probes of adopted instances and datastore nodes.
    pub fn assemble(
        config: &ShiftgridConfig,
        store: Option<StateStore>,
        backend: &dyn ComputeBackend,
    ) -> anyhow::Result<Self> {
        let registry = HealthRegistry::new(ProbeSettings::from(&config.health));

        let mut routers = Vec::new();
        let mut controllers = Vec::new();
        for tier in &config.tiers {
            let router = Arc::new(TrafficRouter::new(&tier.name, registry.clone()));
            let ctrl = DeploymentController::new(
                &tier.name,
                registry.clone(),
                Arc::clone(&router),
                backend.provisioner(tier),
                RollingConfig::from(&tier.rollout),
                store.clone(),
            );

            if let Some(store) = &store {
                forget_stale_slots(store, tier)?;
            }
            for instance in &tier.instances {
                let slot = InstanceSlot::new(
                    &instance.id,
                    Revision::new(&tier.name, &instance.artifact),
                    Lifecycle::Active,
                );
                ctrl.adopt(slot, backend.instance_probe(tier, instance));
            }
            info!(tier = %tier.name, instances = tier.instances.len(), "tier assembled");

            routers.push(router);
            controllers.push(ctrl);
        }

        let replica = match &config.datastore {
            Some(ds) => {
                let replica = ReplicaRouter::new(ds, registry.clone(), store.clone())
                    .context("datastore replica router")?;
                for node in &ds.nodes {
                    registry.register(&node.id, backend.node_probe(node));
                }
                Some(Arc::new(replica))
            }
            None => None,
        };

        let pipeline = PipelineController::new(
            config.pipeline.order.clone(),
            controllers,
            RetryPolicy::from(&config.pipeline),
            store,
        )
        .context("pipeline controller")?;

        Ok(Self {
            registry,
            pipeline,
            routers,
            replica,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            pipeline: self.pipeline.clone(),
            registry: self.registry.clone(),
            replica: self.replica.clone(),
        }
    }

    /// Start the routing loops. They stop when `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for router in &self.routers {
            let router = Arc::clone(router);
            let events = self.registry.subscribe();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                router.run(events, shutdown).await;
            }));
        }
        if let Some(replica) = &self.replica {
            let replica = Arc::clone(replica);
            let events = self.registry.subscribe();
            handles.push(tokio::spawn(async move {
                replica.run(events, shutdown).await;
            }));
        }
        handles
    }
}

/// Drop persisted slots the config no longer lists.
///
/// Instances started by an earlier release are not adoptable: the store
/// does not know their address. They are reported so an operator can
/// reconcile them with the agent.
fn forget_stale_slots(store: &StateStore, tier: &TierConfig) -> anyhow::Result<()> {
    let configured: HashSet<&str> = tier.instances.iter().map(|i| i.id.as_str()).collect();
    for slot in store.list_slots_for_tier(&tier.name)? {
        if configured.contains(slot.id.as_str()) {
            continue;
        }
        warn!(
            tier = %tier.name,
            instance = %slot.id,
            revision = %slot.revision.artifact,
            lifecycle = ?slot.lifecycle,
            "persisted slot is not in the config; not adopting it"
        );
        store.delete_slot(&slot.table_key())?;
    }
    Ok(())
}

/// Run the daemon until Ctrl-C.
pub async fn run_control_plane(
    config: ShiftgridConfig,
    listen: SocketAddr,
    data_dir: &Path,
) -> anyhow::Result<()> {
    info!("Shiftgrid daemon starting");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("shiftgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let backend = AgentBackend {
        probe_timeout: config.health.timeout,
    };
    let plane = ControlPlane::assemble(&config, Some(store), &backend)?;

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.spawn(shutdown_rx);

    // ── REST API server ──────────────────────────────────────────
    let router = shiftgrid_api::build_router(plane.api_state());
    info!(%listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // Clean up. An active run is rolled back before the probes stop.
    if let Some(run) = plane.pipeline.active_run() {
        warn!(run = %run, "aborting active pipeline run");
        if let Err(e) = plane.pipeline.abort(&run) {
            warn!(run = %run, error = %e, "abort failed");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, plane.pipeline.wait(&run))
            .await
            .is_err()
        {
            warn!(run = %run, grace = ?SHUTDOWN_GRACE, "run still rolling back at exit");
        }
    }
    plane.registry.stop_all();
    for handle in handles {
        let _ = handle.await;
    }

    info!("Shiftgrid daemon stopped");
    Ok(())
}
