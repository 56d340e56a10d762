//! shiftgrid.toml configuration parser.
//!
//! Timing and threshold parameters have no defaults: a config that omits
//! the probe interval, a hysteresis threshold, a drain timeout or the
//! primary confirmation window is rejected at parse time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::duration;

/// Errors raised while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShiftgridConfig {
    #[serde(default)]
    pub api: ApiConfig,
    pub health: HealthSettings,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    pub datastore: Option<DatastoreConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the operator API, e.g. "0.0.0.0:8480".
    pub listen: Option<String>,
    /// Directory holding the redb state file.
    pub data_dir: Option<PathBuf>,
}

/// Probe cadence and hysteresis thresholds shared by every monitored entity.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    /// Consecutive successes before an entity is considered healthy.
    pub success_threshold: u32,
    /// Consecutive failures before an entity is considered unhealthy.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Address (host:port) of the compute agent that runs this tier's instances.
    pub agent: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    pub rollout: RolloutSettings,
    /// Instances already running when the daemon starts.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolloutSettings {
    pub batch_size: u32,
    pub max_unavailable: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub startup_timeout: Duration,
    /// Extra attempts per new instance before the plan is rolled back.
    pub startup_retries: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub address: String,
    pub artifact: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    /// How long the primary must stay unhealthy before a replica is promoted.
    #[serde(deserialize_with = "duration::deserialize")]
    pub confirmation_window: Duration,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    pub role: NodeRoleConfig,
    /// Initial replication-lag estimate.
    #[serde(default)]
    pub lag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRoleConfig {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Tier dependency order: earlier tiers are deployed first.
    pub order: Vec<String>,
    pub max_step_retries: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retry_backoff: Duration,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub max_backoff: Option<Duration>,
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

impl ShiftgridConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.success_threshold == 0 || self.health.failure_threshold == 0 {
            return Err(invalid("health thresholds must be at least 1"));
        }
        if self.health.interval.is_zero() {
            return Err(invalid("health interval must be non-zero"));
        }

        let mut tier_names = HashSet::new();
        let mut instance_ids = HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(invalid(format!("duplicate tier '{}'", tier.name)));
            }
            if tier.rollout.batch_size == 0 {
                return Err(invalid(format!("tier '{}': batch_size must be at least 1", tier.name)));
            }
            for inst in &tier.instances {
                if !instance_ids.insert(inst.id.as_str()) {
                    return Err(invalid(format!("duplicate instance id '{}'", inst.id)));
                }
            }
        }

        // Controllers name new slots `{tier}-{n}` and only avoid their own
        // tier's ids, while health state is keyed by id across all tiers.
        for tier in &self.tiers {
            for inst in &tier.instances {
                if let Some(owner) = self.slot_id_owner(&inst.id) {
                    if owner != tier.name {
                        return Err(invalid(format!(
                            "instance '{}' in tier '{}' uses tier '{owner}' slot naming",
                            inst.id, tier.name
                        )));
                    }
                }
            }
        }

        let mut ordered = HashSet::new();
        for name in &self.pipeline.order {
            if !tier_names.contains(name.as_str()) {
                return Err(invalid(format!("pipeline order references unknown tier '{name}'")));
            }
            if !ordered.insert(name.as_str()) {
                return Err(invalid(format!("tier '{name}' appears twice in pipeline order")));
            }
        }
        if ordered.len() != tier_names.len() {
            return Err(invalid("pipeline order must list every tier"));
        }

        if let Some(ds) = &self.datastore {
            let primaries = ds
                .nodes
                .iter()
                .filter(|n| n.role == NodeRoleConfig::Primary)
                .count();
            if primaries != 1 {
                return Err(invalid(format!(
                    "datastore must have exactly one primary, found {primaries}"
                )));
            }
            let mut node_ids = HashSet::new();
            for node in &ds.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    return Err(invalid(format!("duplicate datastore node '{}'", node.id)));
                }
                if instance_ids.contains(node.id.as_str()) {
                    return Err(invalid(format!(
                        "datastore node '{}' collides with an instance id",
                        node.id
                    )));
                }
                if let Some(owner) = self.slot_id_owner(&node.id) {
                    return Err(invalid(format!(
                        "datastore node '{}' uses tier '{owner}' slot naming",
                        node.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Tier whose generated slot ids (`{tier}-{digits}`) match `id`.
    fn slot_id_owner(&self, id: &str) -> Option<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).find(|name| {
            id.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
    }
}

impl FromStr for ShiftgridConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: ShiftgridConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
