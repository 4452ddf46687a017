//! Dispatch of planned actions.
//!
//! Each action is sent to the infrastructure and its effect recorded in
//! the status right away; the next pass observes whether it took hold.
//! Re-running an action that already succeeded leaves the status as it was.

use pgfleet_backup::plan_restore;
use pgfleet_infra::{
    BootstrapRequest, CredentialSource, InfraErrorKind, Infrastructure, InstanceRequest,
    InstanceUpdate, RestoreSource,
};
use pgfleet_planner::Action;
use pgfleet_replication::ReplicationCoordinator;
use pgfleet_state::{
    ClusterSpec, ClusterStatus, FenceReason, HealthStatus, InstancePhase, InstanceRecord,
    InstanceRole, StateStore, VolumeRecord,
};
use tracing::debug;

use crate::error::{ReconcileError, ReconcileResult};

pub struct Executor<'a> {
    pub spec: &'a ClusterSpec,
    pub infra: &'a dyn Infrastructure,
    pub credentials: &'a dyn CredentialSource,
    pub store: &'a StateStore,
}

impl Executor<'_> {
    pub async fn execute(
        &self,
        action: &Action,
        status: &mut ClusterStatus,
        coordinator: &mut ReplicationCoordinator,
        now: u64,
    ) -> ReconcileResult<()> {
        let cluster_id = status.cluster_id.clone();
        let cluster = cluster_id.as_str();
        debug!(%cluster, action = %action, "dispatching");

        match action {
            Action::ProvisionVolume {
                instance,
                ordinal,
                size_bytes,
                storage_class,
            } => {
                self.infra
                    .create_volume(cluster, instance, *size_bytes, storage_class.as_deref())
                    .await?;
                status
                    .volumes
                    .entry(instance.clone())
                    .or_insert_with(|| VolumeRecord {
                        ordinal: *ordinal,
                        size_bytes: *size_bytes,
                        storage_class: storage_class.clone(),
                    });
                status.next_ordinal = status.next_ordinal.max(ordinal + 1);
            }

            Action::CreateInstance {
                instance,
                ordinal,
                role,
                bootstrap,
                image,
                resources,
            } => {
                if status.instance(instance).is_some_and(InstanceRecord::is_live) {
                    return Ok(());
                }
                let bootstrap = if *bootstrap {
                    Some(self.bootstrap_request(now)?)
                } else {
                    None
                };
                self.infra
                    .create_instance(&InstanceRequest {
                        cluster_id: cluster.to_string(),
                        instance_id: instance.clone(),
                        ordinal: *ordinal,
                        image: image.clone(),
                        resources: *resources,
                        role: *role,
                        bootstrap,
                    })
                    .await?;
                status.upsert_instance(InstanceRecord {
                    id: instance.clone(),
                    ordinal: *ordinal,
                    role: *role,
                    phase: InstancePhase::Provisioning,
                    fence_reason: None,
                    health: HealthStatus::Unknown,
                    lag_ms: None,
                    lsn: None,
                    last_seen: None,
                    image: image.clone(),
                    resources: *resources,
                });
                status.next_ordinal = status.next_ordinal.max(ordinal + 1);
            }

            Action::ExpandVolume {
                instance,
                size_bytes,
            } => {
                self.infra
                    .expand_volume(cluster, instance, *size_bytes)
                    .await?;
                if let Some(volume) = status.volumes.get_mut(instance) {
                    volume.size_bytes = volume.size_bytes.max(*size_bytes);
                }
            }

            Action::ApplyResources {
                instance,
                resources,
            } => {
                let update = InstanceUpdate {
                    resources: Some(*resources),
                    ..InstanceUpdate::default()
                };
                self.infra
                    .update_instance(cluster, instance, &update)
                    .await?;
                if let Some(inst) = status.instance_mut(instance) {
                    inst.resources = *resources;
                }
            }

            Action::UpdateImage { instance, image } => {
                let update = InstanceUpdate {
                    image: Some(image.clone()),
                    ..InstanceUpdate::default()
                };
                self.infra
                    .update_instance(cluster, instance, &update)
                    .await?;
                if let Some(inst) = status.instance_mut(instance) {
                    if inst.image != *image && inst.role == InstanceRole::Replica {
                        // Restarted on the new image; must catch up again.
                        inst.phase = InstancePhase::Syncing;
                    }
                    inst.image = image.clone();
                }
            }

            Action::Switchover { from, to } => {
                coordinator
                    .switchover(self.infra, status, from, to)
                    .await?;
            }

            Action::FenceInstance { instance } => {
                self.infra.fence(cluster, instance).await?;
                if let Some(inst) = status.instance_mut(instance) {
                    inst.phase = InstancePhase::Fencing;
                    inst.fence_reason.get_or_insert(FenceReason::ScaleDown);
                }
            }

            Action::DeleteInstance { instance } => {
                ignore_missing(self.infra.delete_instance(cluster, instance).await)?;
                status.remove_instance(instance);
            }

            Action::DeleteVolume { instance } => {
                ignore_missing(self.infra.delete_volume(cluster, instance).await)?;
                status.volumes.remove(instance);
            }
        }
        Ok(())
    }

    /// Initialization parameters for the first instance of the cluster.
    fn bootstrap_request(&self, now: u64) -> ReconcileResult<BootstrapRequest> {
        let secret = &self.spec.bootstrap.owner_secret;
        let owner_password = self.credentials.resolve(secret).ok_or_else(|| {
            ReconcileError::CredentialUnavailable(format!("{}/{}", secret.name, secret.key))
        })?;

        let restore = match &self.spec.bootstrap.recovery {
            Some(recovery) => Some(self.restore_source(
                &recovery.source_cluster,
                recovery.target_time.unwrap_or(now),
            )?),
            None => None,
        };

        Ok(BootstrapRequest {
            database: self.spec.bootstrap.database.clone(),
            owner: self.spec.bootstrap.owner.clone(),
            owner_password,
            restore,
        })
    }

    fn restore_source(&self, source_cluster: &str, target: u64) -> ReconcileResult<RestoreSource> {
        let backups = self.store.list_backups(source_cluster)?;
        let segments = self.store.list_wal_segments(source_cluster)?;
        let plan = plan_restore(&backups, &segments, target)?;
        debug!(
            source = %source_cluster,
            backup = %plan.backup.id,
            wal_segments = plan.wal.len(),
            target,
            "restoring from backup"
        );
        Ok(plan.to_source())
    }
}

fn ignore_missing(result: pgfleet_infra::InfraResult<()>) -> ReconcileResult<()> {
    match result {
        Err(e) if e.kind == InfraErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}
