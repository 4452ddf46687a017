//! Collaborator traits, injected so the control loop can be tested
//! against the simulation.

use std::future::Future;
use std::pin::Pin;

use pgfleet_state::{Lsn, SecretRef};

use crate::error::InfraResult;
use crate::types::*;

/// Boxed future alias for infrastructure calls.
pub type InfraFuture<'a, T> = Pin<Box<dyn Future<Output = InfraResult<T>> + Send + 'a>>;

/// Orchestration platform: compute units and volumes.
///
/// Every call must be idempotent: repeating a create for an instance id
/// that already exists, or a delete for one that is gone, succeeds.
pub trait Infrastructure: Send + Sync {
    fn create_volume<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        size_bytes: u64,
        storage_class: Option<&'a str>,
    ) -> InfraFuture<'a, ()>;

    /// Grow a volume. Shrinking is never requested.
    fn expand_volume<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        size_bytes: u64,
    ) -> InfraFuture<'a, ()>;

    fn delete_volume<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()>;

    fn create_instance<'a>(&'a self, request: &'a InstanceRequest) -> InfraFuture<'a, ()>;

    fn update_instance<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        update: &'a InstanceUpdate,
    ) -> InfraFuture<'a, ()>;

    fn delete_instance<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()>;

    /// Reject writes on the instance and drop it from write routing.
    /// Must succeed for an unreachable instance.
    fn fence<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()>;

    fn unfence<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()>;

    /// Take the instance out of recovery.
    fn promote<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()>;

    /// Probe every instance of the cluster the platform knows about.
    fn observe<'a>(&'a self, cluster: &'a str) -> InfraFuture<'a, Vec<InstanceObservation>>;

    fn base_backup<'a>(&'a self, cluster: &'a str, instance: &'a str)
    -> InfraFuture<'a, BaseBackup>;

    /// WAL written after `from_lsn`, or `None` if nothing new.
    fn fetch_wal<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        from_lsn: Lsn,
    ) -> InfraFuture<'a, Option<WalChunk>>;
}

/// Object storage for backup artifacts.
pub trait ObjectStore: Send + Sync {
    fn put<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        data: &'a [u8],
        credential: &'a Credential,
    ) -> InfraFuture<'a, PutReceipt>;

    fn get<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, Vec<u8>>;

    fn list<'a>(
        &'a self,
        uri: &'a str,
        prefix: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, Vec<String>>;

    fn delete<'a>(
        &'a self,
        uri: &'a str,
        key: &'a str,
        credential: &'a Credential,
    ) -> InfraFuture<'a, ()>;
}

/// Secret store, synced out of band.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, reference: &SecretRef) -> Option<Credential>;
}
