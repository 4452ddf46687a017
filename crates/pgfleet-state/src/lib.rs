//! pgfleet-state — the resource store for pgfleet.
//!
//! Backed by [redb](https://docs.rs/redb), holds the desired state
//! (`ClusterSpec`), the last observed state (`ClusterStatus`), completed
//! backups and the archived WAL ranges of every managed cluster.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Cluster-scoped records use `{namespace}/{name}` keys; child records are
//! keyed `{cluster_id}:{zero-padded sort key}` so a range scan over the
//! cluster prefix returns them in chronological or LSN order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared between the per-cluster reconcile loops and the API.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
