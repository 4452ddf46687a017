//! Point-in-time recovery planning.

use pgfleet_infra::RestoreSource;
use pgfleet_state::{BackupRecord, WalSegmentRecord};
use serde::Serialize;

use crate::error::{BackupError, BackupResult};

/// Base backup plus the WAL to replay on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub target_time: u64,
    pub backup: BackupRecord,
    /// Contiguous segments starting at the backup's `wal_end_lsn`, in LSN
    /// order.
    pub wal: Vec<WalSegmentRecord>,
}

impl RestorePlan {
    pub fn to_source(&self) -> RestoreSource {
        RestoreSource {
            destination_uri: self.backup.destination_uri.clone(),
            base_backup_key: self.backup.object_key.clone(),
            wal_keys: self.wal.iter().map(|s| s.object_key.clone()).collect(),
            target_time: self.target_time,
        }
    }
}

/// Pick the latest backup completed at or before `target` and the WAL that
/// carries it forward to `target`.
pub fn plan_restore(
    backups: &[BackupRecord],
    segments: &[WalSegmentRecord],
    target: u64,
) -> BackupResult<RestorePlan> {
    let unavailable = |reason: String| BackupError::RestoreTargetUnavailable { target, reason };

    let backup = backups
        .iter()
        .filter(|b| b.completed_at <= target)
        .max_by_key(|b| (b.completed_at, b.wal_end_lsn))
        .ok_or_else(|| unavailable("no backup completed at or before the target".to_string()))?;

    let mut wal = Vec::new();
    if backup.completed_at < target {
        let mut ordered: Vec<&WalSegmentRecord> = segments.iter().collect();
        ordered.sort_by_key(|s| s.start_lsn);

        let mut lsn = backup.wal_end_lsn;
        loop {
            let Some(next) = ordered
                .iter()
                .find(|s| s.start_lsn <= lsn && lsn < s.end_lsn)
            else {
                return Err(unavailable(format!("WAL missing after LSN {lsn}")));
            };
            wal.push((*next).clone());
            lsn = next.end_lsn;
            if next.end_time >= target {
                break;
            }
        }
    }

    Ok(RestorePlan {
        target_time: target,
        backup: backup.clone(),
        wal,
    })
}
