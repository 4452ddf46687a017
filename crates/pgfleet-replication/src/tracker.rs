//! Probe bookkeeping for a single instance.

use pgfleet_state::HealthStatus;
use tracing::{debug, warn};

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The instance answered.
    Reachable,
    /// No answer, or the instance was missing from the observation.
    Unreachable,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug, Clone)]
pub struct ProbeTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Missed probes before the instance is declared unhealthy.
    failure_threshold: u32,
}

impl ProbeTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Reachable => {
                if self.status == HealthStatus::Unhealthy {
                    debug!(failures = self.consecutive_failures, "instance answering again");
                }
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unreachable => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.failure_threshold,
                            "instance marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Missed enough probes in a row to act on.
    pub fn is_failed(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Debounces the `Syncing -> Ready` transition of a replica.
///
/// Lag has to stay at or under the threshold for `debounce_secs`; any
/// sample above it restarts the interval.
#[derive(Debug, Clone)]
pub struct LagDebounce {
    threshold_ms: u64,
    debounce_secs: u64,
    below_since: Option<u64>,
}

impl LagDebounce {
    pub fn new(threshold_ms: u64, debounce_secs: u64) -> Self {
        Self {
            threshold_ms,
            debounce_secs,
            below_since: None,
        }
    }

    /// Feed one lag sample taken at `now`. Returns whether the replica has
    /// been caught up for long enough.
    pub fn sample(&mut self, lag_ms: Option<u64>, now: u64) -> bool {
        match lag_ms {
            Some(lag) if lag <= self.threshold_ms => {
                let since = *self.below_since.get_or_insert(now);
                now.saturating_sub(since) >= self.debounce_secs
            }
            _ => {
                self.below_since = None;
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.below_since = None;
    }
}
