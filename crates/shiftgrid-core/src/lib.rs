//! shiftgrid-core: configuration and small shared helpers.
//!
//! The controller is driven entirely by a `shiftgrid.toml` file. Timing
//! parameters (probe interval, drain timeout, confirmation window, ...)
//! are required inputs: the parser refuses to guess them.

pub mod config;
pub mod duration;
pub mod signal;

pub use config::{
    ApiConfig, ConfigError, DatastoreConfig, HealthSettings, InstanceConfig, NodeConfig,
    NodeRoleConfig, PipelineConfig, RolloutSettings, ShiftgridConfig, TierConfig,
};
pub use duration::parse_duration;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
