//! Simulated orchestration platform.

use std::collections::{BTreeMap, HashMap};

use pgfleet_state::{InstanceRole, Lsn, ResourceLimits, epoch_secs};
use tokio::sync::Mutex;
use tracing::debug;

use super::{FaultPlan, SimOp};
use crate::error::{InfraError, InfraResult};
use crate::traits::{InfraFuture, Infrastructure};
use crate::types::*;

/// WAL bytes the simulated primary writes per observation.
const WRITE_RATE: Lsn = 16;

/// Simulated database process.
#[derive(Debug, Clone, PartialEq)]
pub struct SimInstance {
    pub image: String,
    pub resources: ResourceLimits,
    pub role: InstanceRole,
    pub fenced: bool,
    pub crashed: bool,
    pub lag_ms: u64,
    /// Set when bootstrapped from a backup.
    pub restored_from: Option<RestoreSource>,
}

#[derive(Debug, Default)]
struct SimCluster {
    volumes: BTreeMap<String, u64>,
    instances: BTreeMap<String, SimInstance>,
    /// Current end of the WAL stream on the primary.
    wal_lsn: Lsn,
}

#[derive(Debug, Default)]
struct SimState {
    clusters: HashMap<String, SimCluster>,
    /// Manual clock; `None` follows wall time.
    now: Option<u64>,
}

impl SimState {
    fn now(&self) -> u64 {
        self.now.unwrap_or_else(epoch_secs)
    }

    fn cluster(&mut self, cluster: &str) -> &mut SimCluster {
        self.clusters.entry(cluster.to_string()).or_default()
    }
}

/// In-memory platform that honours the idempotency contract of
/// [`Infrastructure`].
#[derive(Debug, Default)]
pub struct SimulatedInfrastructure {
    state: Mutex<SimState>,
    faults: FaultPlan,
}

impl SimulatedInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Freeze the simulation clock at `secs`.
    pub async fn set_time(&self, secs: u64) {
        self.state.lock().await.now = Some(secs);
    }

    /// Make the instance stop answering probes.
    pub async fn crash(&self, cluster: &str, instance: &str) {
        if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
            inst.crashed = true;
        }
    }

    pub async fn recover(&self, cluster: &str, instance: &str) {
        if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
            inst.crashed = false;
        }
    }

    pub async fn set_lag(&self, cluster: &str, instance: &str, lag_ms: u64) {
        if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
            inst.lag_ms = lag_ms;
        }
    }

    /// Make a replica believe it is a primary (split-brain injection).
    pub async fn force_primary_claim(&self, cluster: &str, instance: &str) {
        if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
            inst.role = InstanceRole::Primary;
            inst.lag_ms = 0;
        }
    }

    pub async fn instance(&self, cluster: &str, instance: &str) -> Option<SimInstance> {
        self.state
            .lock()
            .await
            .cluster(cluster)
            .instances
            .get(instance)
            .cloned()
    }

    pub async fn instance_ids(&self, cluster: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .cluster(cluster)
            .instances
            .keys()
            .cloned()
            .collect()
    }

    pub async fn volume_size(&self, cluster: &str, instance: &str) -> Option<u64> {
        self.state
            .lock()
            .await
            .cluster(cluster)
            .volumes
            .get(instance)
            .copied()
    }

    pub async fn volume_ids(&self, cluster: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .cluster(cluster)
            .volumes
            .keys()
            .cloned()
            .collect()
    }
}

impl Infrastructure for SimulatedInfrastructure {
    fn create_volume<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        size_bytes: u64,
        _storage_class: Option<&'a str>,
    ) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::CreateVolume).await?;
            let mut state = self.state.lock().await;
            state
                .cluster(cluster)
                .volumes
                .entry(instance.to_string())
                .or_insert(size_bytes);
            debug!(%cluster, %instance, size_bytes, "sim: volume ready");
            Ok(())
        })
    }

    fn expand_volume<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        size_bytes: u64,
    ) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::ExpandVolume).await?;
            let mut state = self.state.lock().await;
            let volume = state
                .cluster(cluster)
                .volumes
                .get_mut(instance)
                .ok_or_else(|| InfraError::not_found(format!("volume {instance}")))?;
            if size_bytes < *volume {
                return Err(InfraError::rejected("volumes cannot shrink"));
            }
            *volume = size_bytes;
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::DeleteVolume).await?;
            let mut state = self.state.lock().await;
            let sim = state.cluster(cluster);
            if sim.instances.contains_key(instance) {
                return Err(InfraError::rejected(format!("volume {instance} still attached")));
            }
            sim.volumes.remove(instance);
            Ok(())
        })
    }

    fn create_instance<'a>(&'a self, request: &'a InstanceRequest) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::CreateInstance).await?;
            let mut state = self.state.lock().await;
            let sim = state.cluster(&request.cluster_id);
            if !sim.volumes.contains_key(&request.instance_id) {
                return Err(InfraError::rejected(format!(
                    "no volume for {}",
                    request.instance_id
                )));
            }
            if sim.instances.contains_key(&request.instance_id) {
                return Ok(());
            }
            let restored_from = request.bootstrap.as_ref().and_then(|b| b.restore.clone());
            sim.instances.insert(
                request.instance_id.clone(),
                SimInstance {
                    image: request.image.clone(),
                    resources: request.resources,
                    role: request.role,
                    fenced: false,
                    crashed: false,
                    lag_ms: 0,
                    restored_from,
                },
            );
            debug!(cluster = %request.cluster_id, instance = %request.instance_id, role = ?request.role, "sim: instance started");
            Ok(())
        })
    }

    fn update_instance<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        update: &'a InstanceUpdate,
    ) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::UpdateInstance).await?;
            let mut state = self.state.lock().await;
            let inst = state
                .cluster(cluster)
                .instances
                .get_mut(instance)
                .ok_or_else(|| InfraError::not_found(format!("instance {instance}")))?;
            if let Some(image) = &update.image {
                inst.image = image.clone();
            }
            if let Some(resources) = update.resources {
                inst.resources = resources;
            }
            Ok(())
        })
    }

    fn delete_instance<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::DeleteInstance).await?;
            self.state.lock().await.cluster(cluster).instances.remove(instance);
            Ok(())
        })
    }

    fn fence<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::Fence).await?;
            if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
                inst.fenced = true;
            }
            Ok(())
        })
    }

    fn unfence<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::Unfence).await?;
            if let Some(inst) = self.state.lock().await.cluster(cluster).instances.get_mut(instance) {
                inst.fenced = false;
            }
            Ok(())
        })
    }

    fn promote<'a>(&'a self, cluster: &'a str, instance: &'a str) -> InfraFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(SimOp::Promote).await?;
            let mut state = self.state.lock().await;
            let inst = state
                .cluster(cluster)
                .instances
                .get_mut(instance)
                .ok_or_else(|| InfraError::not_found(format!("instance {instance}")))?;
            if inst.crashed {
                return Err(InfraError::transient(format!("{instance} unreachable")));
            }
            inst.role = InstanceRole::Primary;
            inst.fenced = false;
            inst.lag_ms = 0;
            Ok(())
        })
    }

    fn observe<'a>(&'a self, cluster: &'a str) -> InfraFuture<'a, Vec<InstanceObservation>> {
        Box::pin(async move {
            self.faults.check(SimOp::Observe).await?;
            let mut state = self.state.lock().await;
            let sim = state.cluster(cluster);

            let primary_writing = sim
                .instances
                .values()
                .any(|i| i.role == InstanceRole::Primary && !i.fenced && !i.crashed);
            if primary_writing {
                sim.wal_lsn += WRITE_RATE;
            }
            let wal_lsn = sim.wal_lsn;

            Ok(sim
                .instances
                .iter()
                .map(|(id, inst)| {
                    let primary = inst.role == InstanceRole::Primary;
                    InstanceObservation {
                        instance_id: id.clone(),
                        reachable: !inst.crashed,
                        claims_primary: !inst.crashed && primary,
                        lag_ms: (!inst.crashed && !primary).then_some(inst.lag_ms),
                        lsn: (!inst.crashed).then_some(wal_lsn),
                    }
                })
                .collect())
        })
    }

    fn base_backup<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
    ) -> InfraFuture<'a, BaseBackup> {
        Box::pin(async move {
            self.faults.check(SimOp::BaseBackup).await?;
            let mut state = self.state.lock().await;
            let now = state.now();
            let sim = state.cluster(cluster);
            match sim.instances.get(instance) {
                Some(inst) if !inst.crashed => {}
                _ => return Err(InfraError::transient(format!("{instance} unreachable"))),
            }
            let wal_start_lsn = sim.wal_lsn;
            sim.wal_lsn += WRITE_RATE;
            Ok(BaseBackup {
                data: format!("base:{cluster}:{wal_start_lsn}").into_bytes(),
                wal_start_lsn,
                wal_end_lsn: sim.wal_lsn,
                started_at: now,
            })
        })
    }

    fn fetch_wal<'a>(
        &'a self,
        cluster: &'a str,
        instance: &'a str,
        from_lsn: Lsn,
    ) -> InfraFuture<'a, Option<WalChunk>> {
        Box::pin(async move {
            self.faults.check(SimOp::FetchWal).await?;
            let mut state = self.state.lock().await;
            let now = state.now();
            let sim = state.cluster(cluster);
            if !sim.instances.get(instance).is_some_and(|i| !i.crashed) {
                return Err(InfraError::transient(format!("{instance} unreachable")));
            }
            if sim.wal_lsn <= from_lsn {
                return Ok(None);
            }
            Ok(Some(WalChunk {
                start_lsn: from_lsn,
                end_lsn: sim.wal_lsn,
                start_time: now,
                end_time: now,
                data: format!("wal:{cluster}:{from_lsn}-{}", sim.wal_lsn).into_bytes(),
            }))
        })
    }
}
