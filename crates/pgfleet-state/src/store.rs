//! StateStore — redb-backed persistence for pgfleet.
//!
//! Typed CRUD over cluster specs, statuses, backups and WAL segments. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing
//! and for `pgfleetd --in-memory`).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
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

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

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

    /// Create an ephemeral in-memory state store.
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
        for table in [CLUSTER_SPECS, CLUSTER_STATUS, BACKUPS, WAL_SEGMENTS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    // ── Specs ──────────────────────────────────────────────────────

    /// Insert or update a cluster spec.
    pub fn put_spec(&self, spec: &ClusterSpec) -> StateResult<()> {
        let key = spec.id();
        self.put(CLUSTER_SPECS, &key, spec)?;
        debug!(cluster = %key, generation = spec.generation, "cluster spec stored");
        Ok(())
    }

    pub fn get_spec(&self, cluster_id: &str) -> StateResult<Option<ClusterSpec>> {
        self.get(CLUSTER_SPECS, cluster_id)
    }

    pub fn list_specs(&self) -> StateResult<Vec<ClusterSpec>> {
        self.scan(CLUSTER_SPECS, "")
    }

    /// Delete a spec. Returns true if it existed.
    pub fn delete_spec(&self, cluster_id: &str) -> StateResult<bool> {
        self.remove(CLUSTER_SPECS, cluster_id)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn put_status(&self, status: &ClusterStatus) -> StateResult<()> {
        self.put(CLUSTER_STATUS, &status.cluster_id, status)
    }

    pub fn get_status(&self, cluster_id: &str) -> StateResult<Option<ClusterStatus>> {
        self.get(CLUSTER_STATUS, cluster_id)
    }

    pub fn list_statuses(&self) -> StateResult<Vec<ClusterStatus>> {
        self.scan(CLUSTER_STATUS, "")
    }

    pub fn delete_status(&self, cluster_id: &str) -> StateResult<bool> {
        self.remove(CLUSTER_STATUS, cluster_id)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Record a completed backup. Call only after the artifact is durable.
    pub fn put_backup(&self, record: &BackupRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(BACKUPS, &key, record)?;
        debug!(%key, "backup record stored");
        Ok(())
    }

    /// Backups of a cluster, oldest first.
    pub fn list_backups(&self, cluster_id: &str) -> StateResult<Vec<BackupRecord>> {
        self.scan(BACKUPS, &format!("{cluster_id}:"))
    }

    pub fn delete_backup(&self, record: &BackupRecord) -> StateResult<bool> {
        self.remove(BACKUPS, &record.table_key())
    }

    // ── WAL segments ───────────────────────────────────────────────

    pub fn put_wal_segment(&self, segment: &WalSegmentRecord) -> StateResult<()> {
        self.put(WAL_SEGMENTS, &segment.table_key(), segment)
    }

    /// WAL segments of a cluster, in LSN order.
    pub fn list_wal_segments(&self, cluster_id: &str) -> StateResult<Vec<WalSegmentRecord>> {
        self.scan(WAL_SEGMENTS, &format!("{cluster_id}:"))
    }

    pub fn delete_wal_segment(&self, segment: &WalSegmentRecord) -> StateResult<bool> {
        self.remove(WAL_SEGMENTS, &segment.table_key())
    }

    // ── Whole cluster ──────────────────────────────────────────────

    /// Remove the spec, status, backups and WAL records of a cluster in
    /// one write transaction.
    pub fn delete_cluster(&self, cluster_id: &str) -> StateResult<()> {
        let prefix = format!("{cluster_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (spec, status, backups, segments) = {
            let mut specs = txn.open_table(CLUSTER_SPECS).map_err(map_err!(Table))?;
            let mut statuses = txn.open_table(CLUSTER_STATUS).map_err(map_err!(Table))?;
            let mut backups = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            let mut segments = txn.open_table(WAL_SEGMENTS).map_err(map_err!(Table))?;
            let spec = specs.remove(cluster_id).map_err(map_err!(Write))?.is_some();
            let status = statuses.remove(cluster_id).map_err(map_err!(Write))?.is_some();
            let backups = remove_prefix(&mut backups, &prefix)?;
            let segments = remove_prefix(&mut segments, &prefix)?;
            (spec, status, backups, segments)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %cluster_id, spec, status, backups, segments, "cluster records deleted");
        Ok(())
    }
}

/// Delete every key starting with `prefix`. Returns number deleted.
fn remove_prefix(
    t: &mut redb::Table<'_, &'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<u32> {
    let mut keys = Vec::new();
    for entry in t.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }
    for key in &keys {
        t.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len() as u32)
}
