//! StateStore: redb-backed persistence for Shiftgrid.
//!
//! Provides typed operations over pipeline runs, instance slots and the
//! datastore role history. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(SLOTS).map_err(map_err!(Table))?;
        txn.open_table(ROLE_EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Pipeline runs ──────────────────────────────────────────────

    /// Insert or update a pipeline run.
    pub fn put_run(&self, run: &PipelineRun) -> StateResult<()> {
        self.put_json(RUNS, &run.id, run)?;
        debug!(run = %run.id, status = ?run.status, "pipeline run stored");
        Ok(())
    }

    /// Get a pipeline run by id.
    pub fn get_run(&self, run_id: &str) -> StateResult<Option<PipelineRun>> {
        self.get_json(RUNS, run_id)
    }

    /// List all pipeline runs, oldest first.
    pub fn list_runs(&self) -> StateResult<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self.scan_json(RUNS, "")?;
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    // ── Instance slots ─────────────────────────────────────────────

    /// Insert or update an instance slot.
    pub fn put_slot(&self, slot: &InstanceSlot) -> StateResult<()> {
        self.put_json(SLOTS, &slot.table_key(), slot)
    }

    /// List all slots belonging to a tier.
    pub fn list_slots_for_tier(&self, tier: &str) -> StateResult<Vec<InstanceSlot>> {
        self.scan_json(SLOTS, &format!("{tier}:"))
    }

    /// Delete a slot by its composite key. Returns true if it existed.
    pub fn delete_slot(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Role history ───────────────────────────────────────────────

    /// Append a role event. Sequence numbers are write-once.
    pub fn append_role_event(&self, event: &RoleEvent) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLE_EVENTS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::Duplicate(format!("role event {}", event.seq)));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq = event.seq, node = %event.node, "role event appended");
        Ok(())
    }

    /// The full role history in append order.
    pub fn list_role_events(&self) -> StateResult<Vec<RoleEvent>> {
        self.scan_json(ROLE_EVENTS, "")
    }

    // ── JSON helpers ───────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                results.push(item);
            }
        }
        Ok(results)
    }
}
