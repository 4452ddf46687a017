//! Retention selection.

use pgfleet_state::{BackupRecord, Lsn, WalSegmentRecord};

/// What a retention sweep removes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpiredSet {
    pub backups: Vec<BackupRecord>,
    pub wal: Vec<WalSegmentRecord>,
}

/// Backups past `expires_at`, except the most recent one, plus the WAL
/// segments no retained backup needs.
pub fn select_expired(
    backups: &[BackupRecord],
    segments: &[WalSegmentRecord],
    now: u64,
) -> ExpiredSet {
    let Some(newest) = backups
        .iter()
        .max_by_key(|b| (b.completed_at, b.wal_end_lsn))
    else {
        return ExpiredSet::default();
    };

    let (expired, retained): (Vec<&BackupRecord>, Vec<&BackupRecord>) = backups
        .iter()
        .partition(|b| b.expires_at <= now && b.id != newest.id);

    let oldest_needed: Lsn = retained
        .iter()
        .map(|b| b.wal_start_lsn)
        .min()
        .unwrap_or(newest.wal_start_lsn);

    ExpiredSet {
        backups: expired.into_iter().cloned().collect(),
        wal: segments
            .iter()
            .filter(|s| s.end_lsn <= oldest_needed)
            .cloned()
            .collect(),
    }
}
