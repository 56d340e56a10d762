//! Domain types shared by every Shiftgrid component.
//!
//! These types describe revisions, instance slots, health state, datastore
//! roles, deployment plans and pipeline runs. All of them serialize to
//! JSON, both for the redb tables and for the operator API.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use shiftgrid_core::epoch_secs;

/// Name of an independently scaled tier ("web", "api", ...).
pub type TierId = String;

/// Unique identifier of an instance slot.
pub type InstanceId = String;

/// Unique identifier of a datastore node.
pub type NodeId = String;

/// Anything the health registry probes: an instance slot or a datastore node.
pub type EntityId = String;

/// Identifier of a pipeline run.
pub type RunId = String;

// ── Revision ──────────────────────────────────────────────────────

/// Immutable artifact reference produced by the build step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    /// Artifact reference, e.g. `registry.local/api@sha256:...`.
    pub artifact: String,
    pub tier: TierId,
    /// Unix timestamp (seconds) when the build step produced this revision.
    pub created_at: u64,
}

impl Revision {
    pub fn new(tier: &str, artifact: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            tier: tier.to_string(),
            created_at: epoch_secs(),
        }
    }

    /// Two revisions are the same deployable unit when tier and artifact match.
    pub fn same_artifact(&self, other: &Revision) -> bool {
        self.tier == other.tier && self.artifact == other.artifact
    }
}

// ── Instance slot ─────────────────────────────────────────────────

/// Lifecycle phase of an instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Starting,
    Active,
    Draining,
    Terminated,
}

/// One unit of compute within a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSlot {
    pub id: InstanceId,
    pub tier: TierId,
    pub revision: Revision,
    pub lifecycle: Lifecycle,
    /// Unix timestamp (seconds) when the slot was created.
    pub created_at: u64,
}

impl InstanceSlot {
    pub fn new(id: &str, revision: Revision, lifecycle: Lifecycle) -> Self {
        Self {
            id: id.to_string(),
            tier: revision.tier.clone(),
            revision,
            lifecycle,
            created_at: epoch_secs(),
        }
    }

    /// Build the composite key for the slots table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.tier, self.id)
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health status as determined by consecutive probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Last known health of one monitored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Unix timestamp (milliseconds) of the most recent probe.
    pub last_probe_at: Option<u64>,
    /// Unix timestamp (milliseconds) of the most recent status flip.
    pub changed_at: Option<u64>,
}

impl HealthState {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            changed_at: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::unknown()
    }
}

// ── Datastore ─────────────────────────────────────────────────────

/// Role of a datastore node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Replica,
}

/// A datastore node as seen by the replica router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreNode {
    pub id: NodeId,
    pub address: String,
    pub role: NodeRole,
    /// Replication-lag estimate (lower is fresher).
    pub lag: u64,
    pub health: HealthStatus,
}

/// What caused a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionTrigger {
    /// Primary stayed unhealthy past the confirmation window.
    Failover,
    /// Operator override.
    Manual,
}

/// A single role transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleChange {
    /// Initial primary taken from configuration.
    Bootstrap,
    /// Node became primary.
    Promoted {
        previous: Option<NodeId>,
        trigger: PromotionTrigger,
    },
    /// Former primary lost the role and rejoined as a replica.
    Demoted,
}

/// One entry of the append-only role history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEvent {
    pub seq: u64,
    pub node: NodeId,
    pub change: RoleChange,
    /// Unix timestamp (seconds).
    pub at: u64,
}

impl RoleEvent {
    /// Build the table key. Zero-padded so lexical order is sequence order.
    pub fn table_key(&self) -> String {
        format!("{:020}", self.seq)
    }
}

// ── Deployment plan ───────────────────────────────────────────────

/// Status of a deployment plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Rolling,
    Succeeded,
    RolledBack,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded | PlanStatus::RolledBack | PlanStatus::Failed
        )
    }
}

/// Rolling replacement of one tier's instances with a target revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub tier: TierId,
    pub target: Revision,
    pub batch_size: u32,
    pub max_unavailable: u32,
    pub status: PlanStatus,
    /// Why the plan ended the way it did (set on rollback/failure).
    pub reason: Option<String>,
    pub waves_completed: u32,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl DeploymentPlan {
    pub fn new(id: &str, target: Revision, batch_size: u32, max_unavailable: u32) -> Self {
        Self {
            id: id.to_string(),
            tier: target.tier.clone(),
            target,
            batch_size,
            max_unavailable,
            status: PlanStatus::Pending,
            reason: None,
            waves_completed: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move a pending plan to rolling. Returns false if the plan already left pending.
    pub fn begin(&mut self) -> bool {
        if self.status != PlanStatus::Pending {
            return false;
        }
        self.status = PlanStatus::Rolling;
        self.started_at = Some(epoch_secs());
        true
    }

    /// Seal the plan with a terminal status.
    ///
    /// A terminal plan is immutable: later calls return false and change nothing.
    pub fn finish(&mut self, status: PlanStatus, reason: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(epoch_secs());
        true
    }
}

// ── Pipeline run ──────────────────────────────────────────────────

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

/// One release moving through the tiers in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub release: BTreeMap<TierId, Revision>,
    /// Plans in execution order.
    pub plans: Vec<DeploymentPlan>,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub created_at: u64,
    pub finished_at: Option<u64>,
}

impl PipelineRun {
    /// Seal the run. No-op if the run already finished.
    pub fn finish(&mut self, status: RunStatus, reason: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(epoch_secs());
        true
    }

    pub fn plan_for(&self, tier: &str) -> Option<&DeploymentPlan> {
        self.plans.iter().find(|p| p.tier == tier)
    }
}

// ── Routing ───────────────────────────────────────────────────────

/// Instances of one tier currently eligible for traffic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    pub tier: TierId,
    pub members: BTreeSet<InstanceId>,
    /// Bumped on every membership change.
    pub generation: u64,
}

impl RoutingTable {
    pub fn new(tier: &str) -> Self {
        Self {
            tier: tier.to_string(),
            members: BTreeSet::new(),
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }
}
