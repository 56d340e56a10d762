//! redb table definitions for the Shiftgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Pipeline runs keyed by run id.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Instance slots keyed by `{tier}:{instance_id}`.
pub const SLOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");

/// Datastore role history keyed by zero-padded sequence number.
pub const ROLE_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("role_events");
