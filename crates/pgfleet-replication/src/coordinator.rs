//! Role management for one cluster.

use std::collections::HashMap;

use pgfleet_core::ReplicationSettings;
use pgfleet_infra::{InfraError, InstanceObservation, Infrastructure};
use pgfleet_state::{
    ClusterId, ClusterPhase, ClusterStatus, FenceReason, HealthStatus, InstanceId, InstancePhase,
    InstanceRecord, InstanceRole, promotion_candidate,
};
use tracing::{debug, info, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::tracker::{LagDebounce, ProbeResult, ProbeTracker};

/// Role changes made during one coordinator step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleEvent {
    /// Writes are routed to `primary` again.
    Routed { primary: InstanceId },
    ReplicaReady { instance: InstanceId },
    FailedOver {
        from: Option<InstanceId>,
        to: InstanceId,
    },
    /// The primary is gone and no replica can take over.
    NoCandidate { lost: InstanceId },
    Evicted { instance: InstanceId },
    SplitBrain { claimants: Vec<InstanceId> },
    SplitBrainResolved {
        kept: InstanceId,
        fenced: Vec<InstanceId>,
    },
    SwitchedOver { from: InstanceId, to: InstanceId },
}

/// Per-cluster replication coordinator. Owned by that cluster's reconcile
/// loop; probe history lives in memory and restarts empty.
#[derive(Debug)]
pub struct ReplicationCoordinator {
    cluster_id: ClusterId,
    settings: ReplicationSettings,
    probes: HashMap<InstanceId, ProbeTracker>,
    lag: HashMap<InstanceId, LagDebounce>,
    /// When each still-silent `Provisioning` instance was first probed.
    silent_since: HashMap<InstanceId, u64>,
}

impl ReplicationCoordinator {
    pub fn new(cluster_id: &str, settings: &ReplicationSettings) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            settings: settings.clone(),
            probes: HashMap::new(),
            lag: HashMap::new(),
            silent_since: HashMap::new(),
        }
    }

    /// Probe the cluster and act on the result.
    pub async fn run(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        now: u64,
    ) -> ReplicationResult<Vec<RoleEvent>> {
        let observations =
            infra
                .observe(&self.cluster_id)
                .await
                .map_err(|source| ReplicationError::Observe {
                    cluster: self.cluster_id.clone(),
                    source,
                })?;
        self.apply(infra, status, &observations, now).await
    }

    /// Act on one round of observations.
    ///
    /// Order matters: split brain is checked before anything that could
    /// promote, and a lost primary is always fenced before its replacement
    /// is promoted.
    pub async fn apply(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        observations: &[InstanceObservation],
        now: u64,
    ) -> ReplicationResult<Vec<RoleEvent>> {
        let mut events = Vec::new();
        self.observe(status, observations, now, &mut events);

        let claimants = claimants(status, observations);
        if !held(status).is_empty() {
            self.hold_split_brain(infra, status, &claimants, &mut events)
                .await?;
            self.try_auto_resolve(infra, status, observations, &mut events)
                .await?;
            return Ok(events);
        }
        if claimants.len() > 1 {
            self.hold_split_brain(infra, status, &claimants, &mut events)
                .await?;
            return Ok(events);
        }

        let evicted = self.mark_failed_replicas(status, &mut events);
        self.failover_if_needed(infra, status, &mut events).await?;
        for id in evicted {
            self.fence(infra, &id).await?;
        }
        self.route_if_ready(status, &mut events);
        Ok(events)
    }

    /// Planned hand-over of the primary role from `from` to `to`.
    ///
    /// Re-running a completed switchover is a no-op.
    pub async fn switchover(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        from: &str,
        to: &str,
    ) -> ReplicationResult<Vec<RoleEvent>> {
        if status.write_primary() == Some(to) {
            return Ok(Vec::new());
        }
        let held = held(status);
        if !held.is_empty() {
            return Err(ReplicationError::SplitBrain(held));
        }
        if !status.instance(to).is_some_and(InstanceRecord::is_ready_replica) {
            return Err(ReplicationError::NotPromotable(to.to_string()));
        }
        if !status.instance(from).is_some_and(InstanceRecord::is_acting_primary) {
            return Err(ReplicationError::NotPrimary(from.to_string()));
        }

        status.route_unavailable("switchover in progress");
        self.fence(infra, from).await?;
        mark_fenced(status, from, FenceReason::Switchover);
        self.promote(infra, to).await?;
        status.set_primary(to);

        info!(cluster = %self.cluster_id, %from, %to, "switchover complete");
        Ok(vec![RoleEvent::SwitchedOver {
            from: from.to_string(),
            to: to.to_string(),
        }])
    }

    /// Clear a split-brain hold, keeping `keep` as the primary. The other
    /// held instances stay fenced and are rebuilt as replicas.
    pub async fn resolve_split_brain(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        keep: &str,
    ) -> ReplicationResult<Vec<RoleEvent>> {
        let held = held(status);
        if !held.iter().any(|id| id == keep) {
            return Err(ReplicationError::NotHeld(keep.to_string()));
        }

        infra
            .unfence(&self.cluster_id, keep)
            .await
            .map_err(|e| infra_err("unfence", keep, e))?;
        self.promote(infra, keep).await?;

        let fenced: Vec<InstanceId> = held.into_iter().filter(|id| id != keep).collect();
        for id in &fenced {
            mark_fenced(status, id, FenceReason::Failover);
        }
        if let Some(inst) = status.instance_mut(keep) {
            inst.phase = InstancePhase::Ready;
            inst.fence_reason = None;
        }
        status.set_primary(keep);

        info!(cluster = %self.cluster_id, kept = %keep, ?fenced, "split brain resolved");
        Ok(vec![RoleEvent::SplitBrainResolved {
            kept: keep.to_string(),
            fenced,
        }])
    }

    /// Fold probe results into the instance records and advance
    /// `Provisioning -> Syncing -> Ready`.
    fn observe(
        &mut self,
        status: &mut ClusterStatus,
        observations: &[InstanceObservation],
        now: u64,
        events: &mut Vec<RoleEvent>,
    ) {
        let seen: HashMap<&str, &InstanceObservation> = observations
            .iter()
            .map(|o| (o.instance_id.as_str(), o))
            .collect();
        self.probes.retain(|id, _| status.instance(id).is_some());
        self.lag.retain(|id, _| status.instance(id).is_some());
        self.silent_since.retain(|id, _| {
            status
                .instance(id)
                .is_some_and(|i| i.phase == InstancePhase::Provisioning)
        });

        let threshold = self.settings.failure_threshold;
        let lag_threshold = self.settings.lag_threshold_ms;
        let debounce = self.settings.lag_debounce.as_secs();
        let grace = self.settings.startup_grace.as_secs();

        for inst in status.instances.iter_mut() {
            if !inst.is_live() && !is_held(inst) {
                // A replacement under the same id starts with a clean history.
                self.probes.remove(&inst.id);
                self.lag.remove(&inst.id);
                self.silent_since.remove(&inst.id);
                continue;
            }
            let tracker = self
                .probes
                .entry(inst.id.clone())
                .or_insert_with(|| ProbeTracker::new(threshold));

            let Some(obs) = seen.get(inst.id.as_str()).filter(|o| o.reachable) else {
                let counted = inst.phase != InstancePhase::Provisioning || {
                    let since = *self.silent_since.entry(inst.id.clone()).or_insert(now);
                    now.saturating_sub(since) >= grace
                };
                if counted {
                    inst.health = tracker.record(ProbeResult::Unreachable);
                }
                continue;
            };

            self.silent_since.remove(&inst.id);
            inst.health = tracker.record(ProbeResult::Reachable);
            inst.last_seen = Some(now);
            inst.lsn = obs.lsn.or(inst.lsn);
            inst.lag_ms = match inst.role {
                InstanceRole::Primary => Some(0),
                InstanceRole::Replica => obs.lag_ms,
            };

            match (inst.role, inst.phase) {
                (InstanceRole::Primary, InstancePhase::Provisioning) if obs.claims_primary => {
                    inst.phase = InstancePhase::Ready;
                }
                (InstanceRole::Replica, InstancePhase::Provisioning) => {
                    inst.phase = InstancePhase::Syncing;
                }
                _ => {}
            }

            if inst.role == InstanceRole::Replica && inst.phase == InstancePhase::Syncing {
                let gate = self
                    .lag
                    .entry(inst.id.clone())
                    .or_insert_with(|| LagDebounce::new(lag_threshold, debounce));
                if gate.sample(inst.lag_ms, now) {
                    inst.phase = InstancePhase::Ready;
                    gate.reset();
                    debug!(cluster = %self.cluster_id, instance = %inst.id, lag_ms = ?inst.lag_ms, "replica caught up");
                    events.push(RoleEvent::ReplicaReady {
                        instance: inst.id.clone(),
                    });
                }
            }
        }
    }

    /// Fence every claimant and stop routing writes.
    async fn hold_split_brain(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        new_claimants: &[InstanceId],
        events: &mut Vec<RoleEvent>,
    ) -> ReplicationResult<()> {
        for id in new_claimants {
            mark_fenced(status, id, FenceReason::SplitBrain);
        }
        let all = held(status);
        status.route_unavailable("split brain: more than one instance claims primary");
        status.primary = None;
        status.phase = ClusterPhase::SplitBrain;

        if !new_claimants.is_empty() {
            warn!(cluster = %self.cluster_id, claimants = ?all, "split brain detected; fencing all claimants");
            events.push(RoleEvent::SplitBrain {
                claimants: all.clone(),
            });
        }
        // Re-fence on every pass until resolved; fencing is idempotent.
        for id in &all {
            self.fence(infra, id).await?;
        }
        Ok(())
    }

    /// Resolve the hold on its own once exactly one held claimant is still
    /// answering and every other held instance has failed its probes.
    async fn try_auto_resolve(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        observations: &[InstanceObservation],
        events: &mut Vec<RoleEvent>,
    ) -> ReplicationResult<()> {
        let held = held(status);
        let answering: Vec<&InstanceId> = held
            .iter()
            .filter(|id| {
                observations
                    .iter()
                    .any(|o| &o.instance_id == *id && o.reachable && o.claims_primary)
            })
            .collect();
        let [keep] = answering.as_slice() else {
            return Ok(());
        };
        let others_failed = held
            .iter()
            .filter(|id| id != keep)
            .all(|id| self.probes.get(id).is_some_and(ProbeTracker::is_failed));
        if !others_failed {
            return Ok(());
        }

        let keep = (*keep).clone();
        info!(cluster = %self.cluster_id, kept = %keep, "resolving split brain automatically");
        let resolved = self.resolve_split_brain(infra, status, &keep).await?;
        events.extend(resolved);
        Ok(())
    }

    /// Replicas that missed too many probes are marked for replacement.
    fn mark_failed_replicas(
        &self,
        status: &mut ClusterStatus,
        events: &mut Vec<RoleEvent>,
    ) -> Vec<InstanceId> {
        let failed: Vec<InstanceId> = status
            .live_instances()
            .filter(|i| i.role == InstanceRole::Replica && self.is_failed(&i.id))
            .map(|i| i.id.clone())
            .collect();
        for id in &failed {
            warn!(cluster = %self.cluster_id, instance = %id, "evicting unreachable replica");
            mark_fenced(status, id, FenceReason::Evicted);
            events.push(RoleEvent::Evicted {
                instance: id.clone(),
            });
        }
        failed
    }

    async fn failover_if_needed(
        &mut self,
        infra: &dyn Infrastructure,
        status: &mut ClusterStatus,
        events: &mut Vec<RoleEvent>,
    ) -> ReplicationResult<()> {
        let acting = status
            .instances
            .iter()
            .find(|i| i.is_acting_primary())
            .map(|i| i.id.clone());
        let lost = match acting {
            Some(id) if self.is_failed(&id) => Some(id),
            Some(_) => return Ok(()),
            // A primary existed once and is gone (fenced by an earlier,
            // interrupted failover).
            None if status.primary.is_some() => None,
            None => return Ok(()),
        };

        // Lag of a replica that missed this round is stale.
        let answering = status
            .instances
            .iter()
            .filter(|i| self.answered_last_probe(&i.id));
        let Some(candidate) = promotion_candidate(answering).map(|c| c.id.clone()) else {
            if let Some(lost) = lost {
                if status.is_settled() {
                    warn!(cluster = %self.cluster_id, primary = %lost, "primary lost and no replica is ready to take over");
                    events.push(RoleEvent::NoCandidate { lost });
                }
                status.route_unavailable("primary unreachable; no promotable replica");
            }
            status.phase = ClusterPhase::Degraded;
            return Ok(());
        };

        status.phase = ClusterPhase::FailingOver;
        status.route_unavailable("failover in progress");
        if let Some(old) = &lost {
            self.fence(infra, old).await?;
            mark_fenced(status, old, FenceReason::Failover);
        }
        self.promote(infra, &candidate).await?;
        status.set_primary(&candidate);

        info!(
            cluster = %self.cluster_id,
            from = ?lost,
            to = %candidate,
            "failover complete"
        );
        events.push(RoleEvent::FailedOver {
            from: lost,
            to: candidate,
        });
        Ok(())
    }

    /// Route writes to the acting primary once it is ready and answering.
    fn route_if_ready(&self, status: &mut ClusterStatus, events: &mut Vec<RoleEvent>) {
        if status.is_settled() {
            return;
        }
        let ready: Vec<InstanceId> = status
            .instances
            .iter()
            .filter(|i| {
                i.is_acting_primary()
                    && i.phase == InstancePhase::Ready
                    && i.health == HealthStatus::Healthy
            })
            .map(|i| i.id.clone())
            .collect();
        if let [primary] = ready.as_slice() {
            status.set_primary(primary);
            info!(cluster = %self.cluster_id, %primary, "routing writes to primary");
            events.push(RoleEvent::Routed {
                primary: primary.clone(),
            });
        }
    }

    fn is_failed(&self, id: &str) -> bool {
        self.probes.get(id).is_some_and(ProbeTracker::is_failed)
    }

    fn answered_last_probe(&self, id: &str) -> bool {
        self.probes
            .get(id)
            .is_some_and(|t| t.consecutive_failures() == 0 && t.status() == HealthStatus::Healthy)
    }

    async fn fence(&self, infra: &dyn Infrastructure, id: &str) -> ReplicationResult<()> {
        infra
            .fence(&self.cluster_id, id)
            .await
            .map_err(|e| infra_err("fence", id, e))
    }

    async fn promote(&mut self, infra: &dyn Infrastructure, id: &str) -> ReplicationResult<()> {
        infra
            .promote(&self.cluster_id, id)
            .await
            .map_err(|e| infra_err("promote", id, e))?;
        self.lag.remove(id);
        Ok(())
    }
}

fn infra_err(op: &'static str, instance: &str, source: InfraError) -> ReplicationError {
    ReplicationError::Infra {
        op,
        instance: instance.to_string(),
        source,
    }
}

fn is_held(inst: &InstanceRecord) -> bool {
    inst.phase == InstancePhase::Fencing && inst.fence_reason == Some(FenceReason::SplitBrain)
}

fn held(status: &ClusterStatus) -> Vec<InstanceId> {
    status
        .instances
        .iter()
        .filter(|i| is_held(i))
        .map(|i| i.id.clone())
        .collect()
}

/// Live instances that answered and claim to be primary.
fn claimants(status: &ClusterStatus, observations: &[InstanceObservation]) -> Vec<InstanceId> {
    observations
        .iter()
        .filter(|o| o.reachable && o.claims_primary)
        .filter(|o| status.instance(&o.instance_id).is_some_and(InstanceRecord::is_live))
        .map(|o| o.instance_id.clone())
        .collect()
}

fn mark_fenced(status: &mut ClusterStatus, id: &str, reason: FenceReason) {
    if let Some(inst) = status.instance_mut(id) {
        inst.phase = InstancePhase::Fencing;
        inst.fence_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pgfleet_infra::sim::{SimOp, SimulatedInfrastructure};
    use pgfleet_infra::{InfraErrorKind, InstanceRequest};
    use pgfleet_state::ResourceLimits;

    use super::*;

    const CLUSTER: &str = "prod/orders";

    fn settings(debounce_secs: u64) -> ReplicationSettings {
        ReplicationSettings {
            failure_threshold: 3,
            lag_threshold_ms: 100,
            lag_debounce: Duration::from_secs(debounce_secs),
            startup_grace: Duration::from_secs(10),
        }
    }

    fn record(id: &str, ordinal: u32, role: InstanceRole, phase: InstancePhase) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            ordinal,
            role,
            phase,
            fence_reason: None,
            health: HealthStatus::Unknown,
            lag_ms: None,
            lsn: None,
            last_seen: None,
            image: "postgres:16.2".to_string(),
            resources: ResourceLimits {
                cpu_millis: 100,
                memory_bytes: 1,
            },
        }
    }

    async fn start(infra: &SimulatedInfrastructure, id: &str, ordinal: u32, role: InstanceRole) {
        infra.create_volume(CLUSTER, id, 1, None).await.unwrap();
        infra
            .create_instance(&InstanceRequest {
                cluster_id: CLUSTER.to_string(),
                instance_id: id.to_string(),
                ordinal,
                image: "postgres:16.2".to_string(),
                resources: ResourceLimits {
                    cpu_millis: 100,
                    memory_bytes: 1,
                },
                role,
                bootstrap: None,
            })
            .await
            .unwrap();
    }

    /// Primary orders-1, replicas orders-2 (5ms) and orders-3 (50ms), all ready.
    async fn three_node() -> (SimulatedInfrastructure, ClusterStatus) {
        let infra = SimulatedInfrastructure::new();
        let mut status = ClusterStatus::new(CLUSTER);
        start(&infra, "orders-1", 1, InstanceRole::Primary).await;
        start(&infra, "orders-2", 2, InstanceRole::Replica).await;
        start(&infra, "orders-3", 3, InstanceRole::Replica).await;
        infra.set_lag(CLUSTER, "orders-2", 5).await;
        infra.set_lag(CLUSTER, "orders-3", 50).await;

        status.upsert_instance(record("orders-1", 1, InstanceRole::Primary, InstancePhase::Ready));
        status.upsert_instance(record("orders-2", 2, InstanceRole::Replica, InstancePhase::Ready));
        status.upsert_instance(record("orders-3", 3, InstanceRole::Replica, InstancePhase::Ready));
        status.set_primary("orders-1");
        (infra, status)
    }

    #[tokio::test]
    async fn bootstrap_primary_gets_routed() {
        let infra = SimulatedInfrastructure::new();
        start(&infra, "orders-1", 1, InstanceRole::Primary).await;
        let mut status = ClusterStatus::new(CLUSTER);
        status.upsert_instance(record(
            "orders-1",
            1,
            InstanceRole::Primary,
            InstancePhase::Provisioning,
        ));

        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        let events = coord.run(&infra, &mut status, 100).await.unwrap();

        assert_eq!(
            events,
            vec![RoleEvent::Routed {
                primary: "orders-1".to_string()
            }]
        );
        assert_eq!(status.write_primary(), Some("orders-1"));
        assert_eq!(status.instance("orders-1").unwrap().phase, InstancePhase::Ready);
    }

    #[tokio::test]
    async fn replica_ready_after_lag_debounce() {
        let (infra, mut status) = three_node().await;
        start(&infra, "orders-4", 4, InstanceRole::Replica).await;
        infra.set_lag(CLUSTER, "orders-4", 500).await;
        status.upsert_instance(record(
            "orders-4",
            4,
            InstanceRole::Replica,
            InstancePhase::Provisioning,
        ));
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(10));

        coord.run(&infra, &mut status, 1000).await.unwrap();
        assert_eq!(status.instance("orders-4").unwrap().phase, InstancePhase::Syncing);

        infra.set_lag(CLUSTER, "orders-4", 10).await;
        coord.run(&infra, &mut status, 1001).await.unwrap();
        coord.run(&infra, &mut status, 1006).await.unwrap();
        assert_eq!(status.instance("orders-4").unwrap().phase, InstancePhase::Syncing);

        // Spike restarts the interval.
        infra.set_lag(CLUSTER, "orders-4", 400).await;
        coord.run(&infra, &mut status, 1008).await.unwrap();
        infra.set_lag(CLUSTER, "orders-4", 10).await;
        coord.run(&infra, &mut status, 1012).await.unwrap();
        assert_eq!(status.instance("orders-4").unwrap().phase, InstancePhase::Syncing);

        let events = coord.run(&infra, &mut status, 1022).await.unwrap();
        assert_eq!(status.instance("orders-4").unwrap().phase, InstancePhase::Ready);
        assert!(events.contains(&RoleEvent::ReplicaReady {
            instance: "orders-4".to_string()
        }));
    }

    #[tokio::test]
    async fn failover_promotes_lowest_lag_after_threshold() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        coord.run(&infra, &mut status, 1).await.unwrap();

        infra.crash(CLUSTER, "orders-1").await;
        for now in 2..4 {
            let events = coord.run(&infra, &mut status, now).await.unwrap();
            assert!(events.is_empty());
            assert_eq!(status.write_primary(), Some("orders-1"));
        }

        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::FailedOver {
                from: Some("orders-1".to_string()),
                to: "orders-2".to_string(),
            }]
        );
        let old = status.instance("orders-1").unwrap();
        assert_eq!(old.phase, InstancePhase::Fencing);
        assert_eq!(old.fence_reason, Some(FenceReason::Failover));
        assert_eq!(status.write_primary(), Some("orders-2"));
        assert_eq!(status.primary.as_deref(), Some("orders-2"));
        assert_eq!(status.primary_count(), 1);
        assert_eq!(status.phase, ClusterPhase::FailingOver);

        assert!(infra.instance(CLUSTER, "orders-1").await.unwrap().fenced);
        assert_eq!(
            infra.instance(CLUSTER, "orders-2").await.unwrap().role,
            InstanceRole::Primary
        );
    }

    #[tokio::test]
    async fn failover_skips_a_replica_that_went_silent() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        coord.run(&infra, &mut status, 1).await.unwrap();

        infra.crash(CLUSTER, "orders-1").await;
        coord.run(&infra, &mut status, 2).await.unwrap();
        // Lowest recorded lag, but no longer answering.
        infra.crash(CLUSTER, "orders-2").await;
        coord.run(&infra, &mut status, 3).await.unwrap();
        assert_eq!(status.instance("orders-2").unwrap().lag_ms, Some(5));

        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::FailedOver {
                from: Some("orders-1".to_string()),
                to: "orders-3".to_string(),
            }]
        );
        assert_eq!(status.write_primary(), Some("orders-3"));
        assert_eq!(status.primary_count(), 1);
        assert_eq!(infra.faults().calls(SimOp::Promote).await, 1);
    }

    #[tokio::test]
    async fn failed_fence_blocks_promotion() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        infra.crash(CLUSTER, "orders-1").await;
        infra
            .faults()
            .fail_next(SimOp::Fence, 1, InfraErrorKind::Transient)
            .await;

        coord.run(&infra, &mut status, 1).await.unwrap();
        coord.run(&infra, &mut status, 2).await.unwrap();
        let err = coord.run(&infra, &mut status, 3).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Infra { op: "fence", .. }));
        assert!(err.is_transient());
        assert_eq!(infra.faults().calls(SimOp::Promote).await, 0);
        assert_eq!(status.write_primary(), None);
        assert_eq!(status.primary_count(), 1);

        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert!(matches!(events[0], RoleEvent::FailedOver { .. }));
        assert_eq!(status.write_primary(), Some("orders-2"));
        assert_eq!(status.primary_count(), 1);
    }

    #[tokio::test]
    async fn interrupted_promotion_is_retried() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        infra.crash(CLUSTER, "orders-1").await;
        infra
            .faults()
            .fail_next(SimOp::Promote, 1, InfraErrorKind::Transient)
            .await;

        coord.run(&infra, &mut status, 1).await.unwrap();
        coord.run(&infra, &mut status, 2).await.unwrap();
        assert!(coord.run(&infra, &mut status, 3).await.is_err());
        assert_eq!(status.primary_count(), 0);
        assert!(!status.is_settled());

        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::FailedOver {
                from: None,
                to: "orders-2".to_string(),
            }]
        );
        assert_eq!(status.primary_count(), 1);
    }

    #[tokio::test]
    async fn lone_primary_loss_degrades_then_recovers() {
        let infra = SimulatedInfrastructure::new();
        start(&infra, "orders-1", 1, InstanceRole::Primary).await;
        let mut status = ClusterStatus::new(CLUSTER);
        status.upsert_instance(record("orders-1", 1, InstanceRole::Primary, InstancePhase::Ready));
        status.set_primary("orders-1");
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));

        infra.crash(CLUSTER, "orders-1").await;
        for now in 1..3 {
            coord.run(&infra, &mut status, now).await.unwrap();
        }
        let events = coord.run(&infra, &mut status, 3).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::NoCandidate {
                lost: "orders-1".to_string()
            }]
        );
        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert_eq!(status.write_primary(), None);
        assert_eq!(infra.faults().calls(SimOp::Promote).await, 0);

        infra.recover(CLUSTER, "orders-1").await;
        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::Routed {
                primary: "orders-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn unreachable_replica_is_evicted() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        infra.crash(CLUSTER, "orders-3").await;
        for now in 1..=3 {
            coord.run(&infra, &mut status, now).await.unwrap();
        }
        let inst = status.instance("orders-3").unwrap();
        assert_eq!(inst.phase, InstancePhase::Fencing);
        assert_eq!(inst.fence_reason, Some(FenceReason::Evicted));
        assert_eq!(status.write_primary(), Some("orders-1"));
    }

    #[tokio::test]
    async fn silent_new_replica_is_evicted_after_the_grace() {
        let (infra, mut status) = three_node().await;
        start(&infra, "orders-4", 4, InstanceRole::Replica).await;
        infra.crash(CLUSTER, "orders-4").await;
        status.upsert_instance(record(
            "orders-4",
            4,
            InstanceRole::Replica,
            InstancePhase::Provisioning,
        ));
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));

        // Misses inside the grace period are not counted.
        for now in 100..110 {
            assert!(coord.run(&infra, &mut status, now).await.unwrap().is_empty());
        }
        let inst = status.instance("orders-4").unwrap();
        assert_eq!(inst.phase, InstancePhase::Provisioning);
        assert_eq!(inst.health, HealthStatus::Unknown);

        coord.run(&infra, &mut status, 110).await.unwrap();
        coord.run(&infra, &mut status, 111).await.unwrap();
        let events = coord.run(&infra, &mut status, 112).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::Evicted {
                instance: "orders-4".to_string()
            }]
        );
        let inst = status.instance("orders-4").unwrap();
        assert_eq!(inst.phase, InstancePhase::Fencing);
        assert_eq!(inst.fence_reason, Some(FenceReason::Evicted));
        assert_eq!(status.write_primary(), Some("orders-1"));
    }

    #[tokio::test]
    async fn split_brain_fences_every_claimant() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        infra.force_primary_claim(CLUSTER, "orders-3").await;

        let events = coord.run(&infra, &mut status, 1).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::SplitBrain {
                claimants: vec!["orders-1".to_string(), "orders-3".to_string()],
            }]
        );
        assert_eq!(status.phase, ClusterPhase::SplitBrain);
        assert_eq!(status.write_primary(), None);
        assert_eq!(status.primary, None);
        for id in ["orders-1", "orders-3"] {
            assert_eq!(status.instance(id).unwrap().fence_reason, Some(FenceReason::SplitBrain));
            assert!(infra.instance(CLUSTER, id).await.unwrap().fenced);
        }

        // Both still answer: nothing is resolved automatically.
        coord.run(&infra, &mut status, 2).await.unwrap();
        assert_eq!(status.phase, ClusterPhase::SplitBrain);

        let err = coord
            .resolve_split_brain(&infra, &mut status, "orders-2")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::NotHeld(_)));

        coord
            .resolve_split_brain(&infra, &mut status, "orders-3")
            .await
            .unwrap();
        assert_eq!(status.write_primary(), Some("orders-3"));
        assert_eq!(status.primary_count(), 1);
        assert_eq!(
            status.instance("orders-1").unwrap().fence_reason,
            Some(FenceReason::Failover)
        );
        assert!(!infra.instance(CLUSTER, "orders-3").await.unwrap().fenced);
    }

    #[tokio::test]
    async fn split_brain_resolves_when_one_claimant_remains() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        infra.force_primary_claim(CLUSTER, "orders-3").await;
        coord.run(&infra, &mut status, 1).await.unwrap();

        infra.crash(CLUSTER, "orders-1").await;
        for now in 2..4 {
            coord.run(&infra, &mut status, now).await.unwrap();
        }
        let events = coord.run(&infra, &mut status, 4).await.unwrap();
        assert_eq!(
            events,
            vec![RoleEvent::SplitBrainResolved {
                kept: "orders-3".to_string(),
                fenced: vec!["orders-1".to_string()],
            }]
        );
        assert_eq!(status.write_primary(), Some("orders-3"));
    }

    #[tokio::test]
    async fn switchover_fences_then_promotes() {
        let (infra, mut status) = three_node().await;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));

        coord
            .switchover(&infra, &mut status, "orders-1", "orders-2")
            .await
            .unwrap();
        assert_eq!(status.write_primary(), Some("orders-2"));
        assert_eq!(
            status.instance("orders-1").unwrap().fence_reason,
            Some(FenceReason::Switchover)
        );

        // Repeat is a no-op.
        let events = coord
            .switchover(&infra, &mut status, "orders-1", "orders-2")
            .await
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(infra.faults().calls(SimOp::Promote).await, 1);
    }

    #[tokio::test]
    async fn switchover_requires_a_ready_target() {
        let (infra, mut status) = three_node().await;
        status.instance_mut("orders-3").unwrap().phase = InstancePhase::Syncing;
        let mut coord = ReplicationCoordinator::new(CLUSTER, &settings(0));
        let err = coord
            .switchover(&infra, &mut status, "orders-1", "orders-3")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::NotPromotable(_)));
        assert_eq!(status.write_primary(), Some("orders-1"));
    }
}
