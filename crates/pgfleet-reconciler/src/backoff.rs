//! Bounded exponential backoff, recorded as status annotations.

use std::time::Duration;

use pgfleet_state::{ActionAnnotation, ClusterStatus};

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry following the `retries`-th failure.
    pub fn delay(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(31);
        self.base.saturating_mul(1 << exp).min(self.max)
    }

    /// Record a failure of `key`, bumping its retry count.
    pub fn record_failure(
        &self,
        status: &mut ClusterStatus,
        key: &str,
        action: &str,
        error: &ReconcileError,
        generation: u64,
        now: u64,
    ) -> ActionAnnotation {
        let retries = status
            .annotations
            .get(key)
            .filter(|a| a.generation == generation)
            .map_or(0, |a| a.retries)
            + 1;
        let delay = self.delay(retries);
        let annotation = ActionAnnotation {
            action: action.to_string(),
            kind: error.kind().to_string(),
            last_error: error.to_string(),
            retries,
            next_retry_at: now + delay.as_millis().div_ceil(1000) as u64,
            permanent: error.is_permanent(),
            generation,
        };
        status
            .annotations
            .insert(key.to_string(), annotation.clone());
        annotation
    }
}

/// Whether `key` may be attempted at `now` under spec `generation`.
pub fn is_due(status: &ClusterStatus, key: &str, generation: u64, now: u64) -> bool {
    match status.annotations.get(key) {
        None => true,
        Some(a) if a.permanent => a.generation != generation,
        Some(a) => now >= a.next_retry_at,
    }
}
