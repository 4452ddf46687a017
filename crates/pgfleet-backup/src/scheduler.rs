//! Per-cluster backup scheduler.

use std::sync::Arc;

use pgfleet_core::BackupSettings;
use pgfleet_infra::{Credential, CredentialSource, Infrastructure, ObjectStore};
use pgfleet_state::{
    BackupRecord, BackupSpec, ClusterId, ClusterSpec, ClusterStatus, StateStore,
    WalSegmentRecord,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{BackupError, BackupResult};
use crate::retention::select_expired;

/// Outcome of one scheduler tick. Each branch succeeds or fails on its own.
#[derive(Debug, Default)]
pub struct TickReport {
    pub backup: Option<BackupRecord>,
    pub wal_segment: Option<WalSegmentRecord>,
    pub swept_backups: usize,
    pub pruned_wal: usize,
    /// Failed branches keyed `full`, `wal` or `retention`.
    pub errors: Vec<(&'static str, BackupError)>,
}

pub struct BackupScheduler {
    cluster_id: ClusterId,
    settings: BackupSettings,
    store: StateStore,
    objects: Arc<dyn ObjectStore>,
    credentials: Arc<dyn CredentialSource>,
    last_wal_attempt: Option<u64>,
}

impl BackupScheduler {
    pub fn new(
        cluster_id: &str,
        settings: &BackupSettings,
        store: StateStore,
        objects: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            settings: settings.clone(),
            store,
            objects,
            credentials,
            last_wal_attempt: None,
        }
    }

    /// Run whatever is due at `now`: a base backup, a WAL shipment and the
    /// retention sweep.
    pub async fn tick(
        &mut self,
        spec: &ClusterSpec,
        status: &mut ClusterStatus,
        infra: &dyn Infrastructure,
        now: u64,
    ) -> TickReport {
        let mut report = TickReport::default();
        let Some(backup) = &spec.backup else {
            return report;
        };
        let Some(primary) = status.write_primary().map(str::to_string) else {
            debug!(cluster = %self.cluster_id, "no routed primary; backups deferred");
            return report;
        };

        let credential = match self.credential(backup) {
            Ok(c) => c,
            Err(e) => {
                report.errors.push(("full", e));
                return report;
            }
        };
        let retention = spec.retention().unwrap_or_default().as_secs();

        if self.full_backup_due(status, now) {
            match self
                .full_backup(backup, &credential, infra, &primary, retention, now)
                .await
            {
                Ok(record) => {
                    status.last_backup_at = Some(record.completed_at);
                    status.last_archived_lsn.get_or_insert(record.wal_end_lsn);
                    report.backup = Some(record);
                }
                Err(e) => report.errors.push(("full", e)),
            }
        }

        if self.wal_due(now) {
            self.last_wal_attempt = Some(now);
            match self
                .archive_wal(backup, &credential, infra, &primary, status.last_archived_lsn)
                .await
            {
                Ok(Some(segment)) => {
                    status.last_archived_lsn = Some(segment.end_lsn);
                    report.wal_segment = Some(segment);
                }
                Ok(None) => {}
                Err(e) => report.errors.push(("wal", e)),
            }
        }

        match self.sweep(&credential, now).await {
            Ok((backups, wal)) => {
                report.swept_backups = backups;
                report.pruned_wal = wal;
            }
            Err(e) => report.errors.push(("retention", e)),
        }
        report
    }

    fn full_backup_due(&self, status: &ClusterStatus, now: u64) -> bool {
        match status.last_backup_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.settings.full_backup_interval.as_secs(),
        }
    }

    fn wal_due(&self, now: u64) -> bool {
        match self.last_wal_attempt {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.settings.wal_archive_interval.as_secs(),
        }
    }

    fn credential(&self, backup: &BackupSpec) -> BackupResult<Credential> {
        self.credentials
            .resolve(&backup.credentials)
            .ok_or_else(|| BackupError::CredentialUnavailable {
                name: backup.credentials.name.clone(),
                key: backup.credentials.key.clone(),
            })
    }

    /// Take a base backup from `primary`. The record is written only after
    /// the object store confirms the upload is durable.
    async fn full_backup(
        &self,
        backup: &BackupSpec,
        credential: &Credential,
        infra: &dyn Infrastructure,
        primary: &str,
        retention_secs: u64,
        now: u64,
    ) -> BackupResult<BackupRecord> {
        let base = infra
            .base_backup(&self.cluster_id, primary)
            .await
            .map_err(|source| BackupError::Infra {
                op: "base_backup",
                source,
            })?;

        let digest = hex::encode(Sha256::digest(&base.data));
        let id = format!("{now}-{}", &digest[..12]);
        let key = format!("{}/base/{id}", self.cluster_id);
        self.upload(backup, credential, &key, &base.data).await?;

        let record = BackupRecord {
            id,
            cluster_id: self.cluster_id.clone(),
            started_at: base.started_at,
            completed_at: now,
            wal_start_lsn: base.wal_start_lsn,
            wal_end_lsn: base.wal_end_lsn,
            destination_uri: backup.destination_uri.clone(),
            object_key: key,
            size_bytes: base.data.len() as u64,
            digest,
            expires_at: now.saturating_add(retention_secs),
        };
        self.store.put_backup(&record)?;
        info!(
            cluster = %self.cluster_id,
            backup = %record.id,
            size_bytes = record.size_bytes,
            wal_end_lsn = record.wal_end_lsn,
            "base backup recorded"
        );
        Ok(record)
    }

    /// Ship the WAL written since `from`. Nothing is shipped before the
    /// first base backup.
    async fn archive_wal(
        &self,
        backup: &BackupSpec,
        credential: &Credential,
        infra: &dyn Infrastructure,
        primary: &str,
        from: Option<u64>,
    ) -> BackupResult<Option<WalSegmentRecord>> {
        let Some(from) = from else {
            return Ok(None);
        };
        let chunk = infra
            .fetch_wal(&self.cluster_id, primary, from)
            .await
            .map_err(|source| BackupError::Infra {
                op: "fetch_wal",
                source,
            })?;
        let Some(chunk) = chunk else {
            return Ok(None);
        };

        let key = format!("{}/wal/{:020}-{:020}", self.cluster_id, chunk.start_lsn, chunk.end_lsn);
        self.upload(backup, credential, &key, &chunk.data).await?;

        let segment = WalSegmentRecord {
            cluster_id: self.cluster_id.clone(),
            start_lsn: chunk.start_lsn,
            end_lsn: chunk.end_lsn,
            start_time: chunk.start_time,
            end_time: chunk.end_time,
            destination_uri: backup.destination_uri.clone(),
            object_key: key,
        };
        self.store.put_wal_segment(&segment)?;
        debug!(
            cluster = %self.cluster_id,
            start_lsn = segment.start_lsn,
            end_lsn = segment.end_lsn,
            "WAL segment archived"
        );
        Ok(Some(segment))
    }

    /// Upload, deleting the object again if durability is not confirmed.
    async fn upload(
        &self,
        backup: &BackupSpec,
        credential: &Credential,
        key: &str,
        data: &[u8],
    ) -> BackupResult<()> {
        let uri = backup.destination_uri.as_str();
        let result = self.objects.put(uri, key, data, credential).await;
        let err = match result {
            Ok(receipt) if receipt.durable => return Ok(()),
            Ok(_) => BackupError::NotDurable {
                key: key.to_string(),
            },
            Err(source) => BackupError::Infra { op: "put", source },
        };

        if let Err(e) = self.objects.delete(uri, key, credential).await {
            warn!(cluster = %self.cluster_id, %key, error = %e, "failed to remove partial upload");
        }
        Err(err)
    }

    /// Delete expired backups (never the newest) and the WAL only they
    /// needed. An object that cannot be deleted keeps its record so the next
    /// sweep retries it.
    async fn sweep(&self, credential: &Credential, now: u64) -> BackupResult<(usize, usize)> {
        let backups = self.store.list_backups(&self.cluster_id)?;
        let segments = self.store.list_wal_segments(&self.cluster_id)?;
        let expired = select_expired(&backups, &segments, now);

        let mut swept = 0;
        for record in &expired.backups {
            if let Err(e) = self.objects.delete(&record.destination_uri, &record.object_key, credential).await {
                warn!(cluster = %self.cluster_id, backup = %record.id, error = %e, "backup object not deleted");
                continue;
            }
            self.store.delete_backup(record)?;
            swept += 1;
            info!(cluster = %self.cluster_id, backup = %record.id, "expired backup removed");
        }

        let mut pruned = 0;
        for segment in &expired.wal {
            if let Err(e) = self
                .objects
                .delete(&segment.destination_uri, &segment.object_key, credential)
                .await
            {
                warn!(cluster = %self.cluster_id, key = %segment.object_key, error = %e, "WAL object not deleted");
                continue;
            }
            self.store.delete_wal_segment(segment)?;
            pruned += 1;
        }
        Ok((swept, pruned))
    }
}
