//! redb table definitions for the pgfleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Desired cluster specs keyed by `{namespace}/{name}`.
pub const CLUSTER_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_specs");

/// Observed cluster status keyed by `{namespace}/{name}`.
pub const CLUSTER_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_status");

/// Completed backups keyed by `{cluster_id}:{completed_at:020}:{backup_id}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

/// Archived WAL chunks keyed by `{cluster_id}:{start_lsn:020}`.
pub const WAL_SEGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("wal_segments");
