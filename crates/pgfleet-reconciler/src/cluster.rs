//! Per-cluster reconcile worker and its loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pgfleet_backup::BackupScheduler;
use pgfleet_core::{ControllerSettings, FleetConfig};
use pgfleet_infra::{CredentialSource, Infrastructure, ObjectStore};
use pgfleet_planner::{Action, plan, satisfies};
use pgfleet_replication::{ReplicationCoordinator, RoleEvent};
use pgfleet_state::{
    ClusterId, ClusterPhase, ClusterSpec, ClusterStatus, FenceReason, InstanceId, InstancePhase,
    StateStore, epoch_secs,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, is_due};
use crate::error::{ReconcileError, ReconcileResult};
use crate::executor::Executor;

/// Annotation key for coordinator failures.
pub const REPLICATION_KEY: &str = "replication";

const BACKUP_PREFIX: &str = "backup/";
const BACKUP_BRANCHES: [&str; 3] = ["full", "wal", "retention"];

/// Branch for actions that are not tied to a single instance.
const CLUSTER_BRANCH: &str = "cluster";

/// New ordinals are handed out in order; once one fails to provision, the
/// ones after it wait so the retry keeps its id.
const NEW_ORDINALS: &str = "new-ordinals";

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub completed: usize,
    pub failed: usize,
    /// Actions held back by a failed branch or a pending backoff.
    pub skipped: usize,
    /// The spec changed while dispatching; the rest of the plan was dropped.
    pub conflict: bool,
    /// Nothing left to do and the cluster is healthy.
    pub converged: bool,
}

/// Requests handled inside the serialized loop.
#[derive(Debug)]
pub enum Command {
    ResolveSplitBrain {
        keep: InstanceId,
        reply: oneshot::Sender<ReconcileResult<()>>,
    },
}

/// Owns everything one cluster's loop mutates: its status, probe history and
/// backup cadence.
pub struct ClusterWorker {
    cluster_id: ClusterId,
    store: StateStore,
    infra: Arc<dyn Infrastructure>,
    credentials: Arc<dyn CredentialSource>,
    coordinator: ReplicationCoordinator,
    backups: BackupScheduler,
    backoff: Backoff,
    status: ClusterStatus,
    publish: watch::Sender<ClusterStatus>,
}

impl ClusterWorker {
    /// Worker resuming from the stored status, if there is one.
    pub fn new(
        cluster_id: &str,
        config: &FleetConfig,
        store: StateStore,
        infra: Arc<dyn Infrastructure>,
        objects: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialSource>,
    ) -> ReconcileResult<Self> {
        let status = store
            .get_status(cluster_id)?
            .unwrap_or_else(|| ClusterStatus::new(cluster_id));
        let (publish, _) = watch::channel(status.clone());
        Ok(Self {
            cluster_id: cluster_id.to_string(),
            coordinator: ReplicationCoordinator::new(cluster_id, &config.replication),
            backups: BackupScheduler::new(
                cluster_id,
                &config.backup,
                store.clone(),
                objects,
                credentials.clone(),
            ),
            backoff: Backoff::new(config.controller.base_backoff, config.controller.max_backoff),
            store,
            infra,
            credentials,
            status,
            publish,
        })
    }

    pub fn status(&self) -> &ClusterStatus {
        &self.status
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.publish.subscribe()
    }

    /// One reconcile pass: observe, coordinate roles, plan, dispatch, run
    /// backups, then persist and publish the status.
    pub async fn run_pass(&mut self, now: u64) -> ReconcileResult<PassReport> {
        let spec = self.load_spec()?;
        let generation = spec.generation;
        let mut report = PassReport::default();

        self.status
            .annotations
            .retain(|_, a| !(a.permanent && a.generation != generation));

        self.coordinate(generation, now).await;

        let plan = plan(&spec, &self.status);
        self.status.ignored_drift = plan.ignored.iter().map(ToString::to_string).collect();
        for drift in &plan.ignored {
            debug!(cluster = %self.cluster_id, %drift, "drift ignored");
        }

        let planned: HashSet<String> = plan.actions.iter().map(|a| a.key()).collect();
        self.status.annotations.retain(|key, _| {
            key == REPLICATION_KEY || key.starts_with(BACKUP_PREFIX) || planned.contains(key)
        });

        let executor = Executor {
            spec: &spec,
            infra: self.infra.as_ref(),
            credentials: self.credentials.as_ref(),
            store: &self.store,
        };
        let first_new_ordinal = self.status.next_ordinal;
        let mut blocked: HashSet<&str> = HashSet::new();
        for action in &plan.actions {
            let branch = action.instance().unwrap_or(CLUSTER_BRANCH);
            let key = action.key();
            let new_ordinal = matches!(
                action,
                Action::ProvisionVolume { ordinal, .. } if *ordinal >= first_new_ordinal
            );
            if blocked.contains(branch) || (new_ordinal && blocked.contains(NEW_ORDINALS)) {
                blocked.insert(branch);
                report.skipped += 1;
                continue;
            }
            if !is_due(&self.status, &key, generation, now) {
                debug!(cluster = %self.cluster_id, %key, "waiting out backoff");
                blocked.insert(branch);
                if new_ordinal {
                    blocked.insert(NEW_ORDINALS);
                }
                report.skipped += 1;
                continue;
            }

            let current = self
                .store
                .get_spec(&self.cluster_id)?
                .map_or(generation, |s| s.generation);
            if current != generation {
                let conflict = ReconcileError::Conflict {
                    planned: generation,
                    current,
                };
                info!(cluster = %self.cluster_id, %conflict, "re-planning");
                report.conflict = true;
                break;
            }

            match executor
                .execute(action, &mut self.status, &mut self.coordinator, now)
                .await
            {
                Ok(()) => {
                    self.status.annotations.remove(&key);
                    report.completed += 1;
                }
                Err(e) => {
                    let annotation = self.backoff.record_failure(
                        &mut self.status,
                        &key,
                        &action.to_string(),
                        &e,
                        generation,
                        now,
                    );
                    warn!(
                        cluster = %self.cluster_id,
                        %key,
                        error = %e,
                        retries = annotation.retries,
                        next_retry_at = annotation.next_retry_at,
                        permanent = annotation.permanent,
                        "action failed"
                    );
                    blocked.insert(branch);
                    if new_ordinal {
                        blocked.insert(NEW_ORDINALS);
                    }
                    report.failed += 1;
                }
            }
        }

        if !report.conflict {
            self.run_backups(&spec, generation, now).await;
            self.status.observed_generation = generation;
        }

        self.status.phase = cluster_phase(&spec, &self.status);
        report.converged = !report.conflict && self.status.phase == ClusterPhase::Healthy;
        self.status.updated_at = now;
        self.persist()?;

        debug!(
            cluster = %self.cluster_id,
            phase = ?self.status.phase,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "pass finished"
        );
        Ok(report)
    }

    /// Keep `keep` as the primary of a cluster held in split brain.
    pub async fn resolve_split_brain(&mut self, keep: &str) -> ReconcileResult<()> {
        self.coordinator
            .resolve_split_brain(self.infra.as_ref(), &mut self.status, keep)
            .await?;
        self.status.annotations.remove(REPLICATION_KEY);
        self.persist()
    }

    fn load_spec(&self) -> ReconcileResult<ClusterSpec> {
        self.store
            .get_spec(&self.cluster_id)?
            .ok_or_else(|| ReconcileError::UnknownCluster(self.cluster_id.clone()))
    }

    async fn coordinate(&mut self, generation: u64, now: u64) {
        match self
            .coordinator
            .run(self.infra.as_ref(), &mut self.status, now)
            .await
        {
            Ok(events) => {
                for event in &events {
                    if let RoleEvent::SplitBrain { claimants } = event {
                        error!(cluster = %self.cluster_id, ?claimants, "split brain; writes stopped");
                    }
                }
                let held = held(&self.status);
                if held.is_empty() {
                    self.status.annotations.remove(REPLICATION_KEY);
                } else {
                    let err = ReconcileError::SplitBrainRisk(held);
                    self.backoff.record_failure(
                        &mut self.status,
                        REPLICATION_KEY,
                        "hold split brain",
                        &err,
                        generation,
                        now,
                    );
                }
            }
            Err(e) => {
                let err = ReconcileError::from(e);
                warn!(cluster = %self.cluster_id, error = %err, "replication step failed");
                self.backoff.record_failure(
                    &mut self.status,
                    REPLICATION_KEY,
                    "coordinate roles",
                    &err,
                    generation,
                    now,
                );
            }
        }
    }

    async fn run_backups(&mut self, spec: &ClusterSpec, generation: u64, now: u64) {
        let tick = self
            .backups
            .tick(spec, &mut self.status, self.infra.as_ref(), now)
            .await;
        if let Some(backup) = &tick.backup {
            info!(cluster = %self.cluster_id, backup = %backup.id, size_bytes = backup.size_bytes, "base backup stored");
        }

        let mut failed = HashSet::new();
        for (branch, e) in tick.errors {
            let key = format!("{BACKUP_PREFIX}{branch}");
            let err = ReconcileError::from(e);
            warn!(cluster = %self.cluster_id, %key, error = %err, "backup step failed");
            self.backoff.record_failure(
                &mut self.status,
                &key,
                &format!("{branch} backup"),
                &err,
                generation,
                now,
            );
            failed.insert(branch);
        }
        for branch in BACKUP_BRANCHES {
            if !failed.contains(branch) {
                self.status
                    .annotations
                    .remove(&format!("{BACKUP_PREFIX}{branch}"));
            }
        }
    }

    fn persist(&mut self) -> ReconcileResult<()> {
        self.store.put_status(&self.status)?;
        self.publish.send_replace(self.status.clone());
        Ok(())
    }
}

/// Instances held by a split-brain fence.
fn held(status: &ClusterStatus) -> Vec<InstanceId> {
    status
        .instances
        .iter()
        .filter(|i| {
            i.phase == InstancePhase::Fencing && i.fence_reason == Some(FenceReason::SplitBrain)
        })
        .map(|i| i.id.clone())
        .collect()
}

/// Cluster phase derived at the end of a pass.
fn cluster_phase(spec: &ClusterSpec, status: &ClusterStatus) -> ClusterPhase {
    if !held(status).is_empty() {
        return ClusterPhase::SplitBrain;
    }
    if !status.is_settled() {
        return match (status.primary.as_ref(), status.phase) {
            (None, _) => ClusterPhase::Initializing,
            (Some(_), ClusterPhase::FailingOver) => ClusterPhase::FailingOver,
            (Some(_), _) => ClusterPhase::Degraded,
        };
    }
    let all_ready = status
        .live_instances()
        .all(|i| i.phase == InstancePhase::Ready);
    if all_ready && satisfies(spec, status) {
        ClusterPhase::Healthy
    } else {
        ClusterPhase::Reconciling
    }
}

/// Channels that drive one cluster loop.
pub struct LoopChannels {
    pub triggers: mpsc::Receiver<()>,
    pub commands: mpsc::Receiver<Command>,
    pub shutdown: watch::Receiver<bool>,
}

/// Run passes until shut down. A pass runs immediately, after every
/// trigger or command, and otherwise on the resync/requeue cadence.
pub async fn run_cluster_loop(
    mut worker: ClusterWorker,
    settings: ControllerSettings,
    mut channels: LoopChannels,
) {
    let cluster_id = worker.cluster_id.clone();
    info!(cluster = %cluster_id, "reconcile loop starting");

    loop {
        let delay = match worker.run_pass(epoch_secs()).await {
            Ok(report) if report.conflict => Duration::ZERO,
            Ok(report) if report.converged => settings.resync_interval,
            Ok(_) => settings.requeue_interval,
            Err(ReconcileError::UnknownCluster(_)) => {
                info!(cluster = %cluster_id, "spec removed; reconcile loop exiting");
                break;
            }
            Err(e) => {
                error!(cluster = %cluster_id, error = %e, "reconcile pass failed");
                settings.requeue_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            trigger = channels.triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                debug!(cluster = %cluster_id, "pass triggered");
            }
            Some(command) = channels.commands.recv() => match command {
                Command::ResolveSplitBrain { keep, reply } => {
                    let result = worker.resolve_split_brain(&keep).await;
                    let _ = reply.send(result);
                }
            },
            _ = channels.shutdown.changed() => {
                break;
            }
        }
    }
    debug!(cluster = %cluster_id, "reconcile loop stopped");
}

#[cfg(test)]
mod tests {
    use pgfleet_core::ReplicationSettings;
    use pgfleet_infra::InfraErrorKind;
    use pgfleet_infra::sim::{
        MemoryObjectStore, SimOp, SimulatedInfrastructure, StaticCredentials,
    };
    use pgfleet_state::{
        BackupSpec, BootstrapSpec, InstanceRole, RecoverySource, ResourceLimits, SecretRef,
        StorageSpec,
    };

    use super::*;

    pub(crate) fn spec(instances: u32) -> ClusterSpec {
        ClusterSpec {
            namespace: "prod".to_string(),
            name: "orders".to_string(),
            instances,
            storage: StorageSpec {
                size_bytes: 100,
                storage_class: None,
            },
            image: "postgres:16.2".to_string(),
            resources: ResourceLimits {
                cpu_millis: 500,
                memory_bytes: 1 << 20,
            },
            bootstrap: BootstrapSpec {
                database: "app".to_string(),
                owner: "app".to_string(),
                owner_secret: SecretRef {
                    name: "orders-app".to_string(),
                    key: "password".to_string(),
                },
                recovery: None,
            },
            backup: None,
            generation: 1,
        }
    }

    fn config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.replication = ReplicationSettings {
            failure_threshold: 3,
            lag_threshold_ms: 100,
            lag_debounce: Duration::ZERO,
            startup_grace: Duration::ZERO,
        };
        config.controller.base_backoff = Duration::from_secs(1);
        config.controller.max_backoff = Duration::from_secs(8);
        config
    }

    struct Harness {
        store: StateStore,
        infra: Arc<SimulatedInfrastructure>,
        objects: Arc<MemoryObjectStore>,
        worker: ClusterWorker,
    }

    fn harness(spec: &ClusterSpec, creds: StaticCredentials) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        store.put_spec(spec).unwrap();
        let infra = Arc::new(SimulatedInfrastructure::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let worker = ClusterWorker::new(
            &spec.id(),
            &config(),
            store.clone(),
            infra.clone(),
            objects.clone(),
            Arc::new(creds),
        )
        .unwrap();
        Harness {
            store,
            infra,
            objects,
            worker,
        }
    }

    fn creds() -> StaticCredentials {
        StaticCredentials::new()
            .with("orders-app", "password", "pw")
            .with("orders-s3", "key", "s3")
    }

    async fn converge(h: &mut Harness, from: u64, passes: u64) -> u64 {
        let mut now = from;
        for _ in 0..passes {
            let report = h.worker.run_pass(now).await.unwrap();
            now += 1;
            if report.converged {
                break;
            }
        }
        now
    }

    fn assert_single_primary(status: &ClusterStatus) {
        if status.is_settled() {
            assert_eq!(status.primary_count(), 1, "{status:#?}");
            assert_eq!(status.write_primary(), status.primary.as_deref());
        }
    }

    #[tokio::test]
    async fn bootstrap_converges_to_healthy() {
        let spec = spec(3);
        let mut h = harness(&spec, creds());
        converge(&mut h, 0, 10).await;

        let status = h.worker.status().clone();
        assert_eq!(status.phase, ClusterPhase::Healthy);
        assert_eq!(status.write_primary(), Some("orders-1"));
        assert_eq!(status.live_count(), 3);
        assert_eq!(status.observed_generation, 1);
        assert!(status.annotations.is_empty());
        assert_eq!(
            h.infra.instance_ids("prod/orders").await,
            vec!["orders-1", "orders-2", "orders-3"]
        );
        assert_eq!(h.store.get_status("prod/orders").unwrap().unwrap(), status);
        assert_eq!(*h.worker.subscribe().borrow(), status);
    }

    #[tokio::test]
    async fn replica_that_never_answers_is_replaced() {
        let spec = spec(2);
        let mut h = harness(&spec, creds());
        let mut now = 0;
        h.worker.run_pass(now).await.unwrap();
        h.infra.crash("prod/orders", "orders-2").await;

        for _ in 0..20 {
            now += 1;
            h.worker.run_pass(now).await.unwrap();
            let status = h.worker.status();
            if status.phase == ClusterPhase::Healthy {
                assert!(status.live_instances().all(|i| i.phase == InstancePhase::Ready));
            }
        }

        let status = h.worker.status();
        assert_eq!(status.phase, ClusterPhase::Healthy);
        assert_eq!(status.instance("orders-2").unwrap().phase, InstancePhase::Ready);
        assert_eq!(status.write_primary(), Some("orders-1"));
        assert!(!h.infra.instance("prod/orders", "orders-2").await.unwrap().crashed);
    }

    #[tokio::test]
    async fn failover_keeps_exactly_one_primary() {
        let spec = spec(3);
        let mut h = harness(&spec, creds());
        let mut now = converge(&mut h, 0, 10).await;
        h.infra.set_lag("prod/orders", "orders-2", 5).await;
        h.infra.set_lag("prod/orders", "orders-3", 50).await;
        h.worker.run_pass(now).await.unwrap();

        h.infra.crash("prod/orders", "orders-1").await;
        for _ in 0..20 {
            now += 1;
            h.worker.run_pass(now).await.unwrap();
            assert_single_primary(h.worker.status());
            if h.worker.status().phase == ClusterPhase::Healthy
                && h.worker.status().write_primary() == Some("orders-2")
            {
                break;
            }
        }

        let status = h.worker.status();
        assert_eq!(status.write_primary(), Some("orders-2"));
        assert_eq!(status.phase, ClusterPhase::Healthy);
        assert_eq!(status.live_count(), 3);
        // The old primary was rebuilt on its volume as a replica.
        let old = status.instance("orders-1").unwrap();
        assert_eq!(old.role, InstanceRole::Replica);
        assert!(!h.infra.instance("prod/orders", "orders-1").await.unwrap().fenced);
    }

    #[tokio::test]
    async fn failing_branch_does_not_block_others() {
        let spec = spec(3);
        let mut h = harness(&spec, creds());
        converge(&mut h, 0, 10).await;

        let mut resized = spec.clone();
        resized.resources.cpu_millis = 1000;
        resized.generation = 2;
        h.store.put_spec(&resized).unwrap();
        h.infra
            .faults()
            .fail_next(SimOp::UpdateInstance, 1, InfraErrorKind::Transient)
            .await;

        let report = h.worker.run_pass(100).await.unwrap();
        assert_eq!((report.completed, report.failed), (2, 1));
        let ann = &h.worker.status().annotations["apply_resources/orders-1"];
        assert_eq!(ann.kind, "transient_infra");
        assert_eq!(ann.retries, 1);
        assert_eq!(ann.next_retry_at, 101);
        assert_eq!(h.worker.status().phase, ClusterPhase::Reconciling);

        // Still backing off at the same instant.
        let report = h.worker.run_pass(100).await.unwrap();
        assert_eq!((report.completed, report.skipped), (0, 1));

        let report = h.worker.run_pass(101).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(h.worker.status().annotations.is_empty());
        assert_eq!(h.worker.status().phase, ClusterPhase::Healthy);
        assert_eq!(
            h.infra.instance("prod/orders", "orders-1").await.unwrap().resources.cpu_millis,
            1000
        );
    }

    #[tokio::test]
    async fn failed_provision_holds_back_later_ordinals() {
        let spec = spec(3);
        let mut h = harness(&spec, creds());
        converge(&mut h, 0, 10).await;

        let mut scaled = spec.clone();
        scaled.instances = 5;
        scaled.generation = 2;
        h.store.put_spec(&scaled).unwrap();
        h.infra
            .faults()
            .fail_next(SimOp::CreateVolume, 1, InfraErrorKind::Transient)
            .await;

        let report = h.worker.run_pass(100).await.unwrap();
        assert_eq!((report.failed, report.skipped, report.completed), (1, 3, 0));
        assert_eq!(h.worker.status().next_ordinal, 4);

        let report = h.worker.run_pass(101).await.unwrap();
        assert_eq!(report.completed, 4);
        assert_eq!(
            h.infra.instance_ids("prod/orders").await,
            vec!["orders-1", "orders-2", "orders-3", "orders-4", "orders-5"]
        );
    }

    /// Bumps the stored spec generation when a volume is created.
    struct BumpOnCreate {
        inner: SimulatedInfrastructure,
        store: StateStore,
    }

    impl Infrastructure for BumpOnCreate {
        fn create_volume<'a>(
            &'a self,
            cluster: &'a str,
            instance: &'a str,
            size_bytes: u64,
            storage_class: Option<&'a str>,
        ) -> pgfleet_infra::InfraFuture<'a, ()> {
            Box::pin(async move {
                self.inner
                    .create_volume(cluster, instance, size_bytes, storage_class)
                    .await?;
                let mut spec = self.store.get_spec(cluster).unwrap().unwrap();
                spec.generation += 1;
                self.store.put_spec(&spec).unwrap();
                Ok(())
            })
        }
        fn expand_volume<'a>(&'a self, c: &'a str, i: &'a str, s: u64) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.expand_volume(c, i, s)
        }
        fn delete_volume<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.delete_volume(c, i)
        }
        fn create_instance<'a>(&'a self, r: &'a pgfleet_infra::InstanceRequest) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.create_instance(r)
        }
        fn update_instance<'a>(
            &'a self,
            c: &'a str,
            i: &'a str,
            u: &'a pgfleet_infra::InstanceUpdate,
        ) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.update_instance(c, i, u)
        }
        fn delete_instance<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.delete_instance(c, i)
        }
        fn fence<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.fence(c, i)
        }
        fn unfence<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.unfence(c, i)
        }
        fn promote<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, ()> {
            self.inner.promote(c, i)
        }
        fn observe<'a>(&'a self, c: &'a str) -> pgfleet_infra::InfraFuture<'a, Vec<pgfleet_infra::InstanceObservation>> {
            self.inner.observe(c)
        }
        fn base_backup<'a>(&'a self, c: &'a str, i: &'a str) -> pgfleet_infra::InfraFuture<'a, pgfleet_infra::BaseBackup> {
            self.inner.base_backup(c, i)
        }
        fn fetch_wal<'a>(
            &'a self,
            c: &'a str,
            i: &'a str,
            from: u64,
        ) -> pgfleet_infra::InfraFuture<'a, Option<pgfleet_infra::WalChunk>> {
            self.inner.fetch_wal(c, i, from)
        }
    }

    #[tokio::test]
    async fn spec_change_mid_pass_stops_dispatch() {
        let spec = spec(1);
        let store = StateStore::open_in_memory().unwrap();
        store.put_spec(&spec).unwrap();
        let infra = Arc::new(BumpOnCreate {
            inner: SimulatedInfrastructure::new(),
            store: store.clone(),
        });
        let mut worker = ClusterWorker::new(
            &spec.id(),
            &config(),
            store.clone(),
            infra.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(creds()),
        )
        .unwrap();

        let report = worker.run_pass(0).await.unwrap();
        assert!(report.conflict);
        assert_eq!(report.completed, 1);
        assert!(!report.converged);
        // The dispatched volume stands; the create was never sent.
        assert!(worker.status().volumes.contains_key("orders-1"));
        assert!(worker.status().instances.is_empty());
        assert_eq!(worker.status().observed_generation, 0);
        assert!(infra.inner.instance_ids("prod/orders").await.is_empty());
    }

    #[tokio::test]
    async fn split_brain_stops_writes_until_resolved() {
        let spec = spec(3);
        let mut h = harness(&spec, creds());
        let now = converge(&mut h, 0, 10).await;

        h.infra.force_primary_claim("prod/orders", "orders-3").await;
        h.worker.run_pass(now).await.unwrap();
        let status = h.worker.status();
        assert_eq!(status.phase, ClusterPhase::SplitBrain);
        assert!(!status.is_settled());
        assert_eq!(status.annotations[REPLICATION_KEY].kind, "split_brain_risk");
        assert!(h.infra.instance("prod/orders", "orders-1").await.unwrap().fenced);
        assert!(h.infra.instance("prod/orders", "orders-3").await.unwrap().fenced);

        // Held: no instances are added or replaced meanwhile.
        h.worker.run_pass(now + 1).await.unwrap();
        assert_eq!(h.infra.instance_ids("prod/orders").await.len(), 3);
        assert_eq!(h.worker.status().phase, ClusterPhase::SplitBrain);

        h.worker.resolve_split_brain("orders-1").await.unwrap();
        assert_eq!(h.worker.status().write_primary(), Some("orders-1"));
        assert!(!h.worker.status().annotations.contains_key(REPLICATION_KEY));

        let mut now = now + 2;
        for _ in 0..10 {
            let report = h.worker.run_pass(now).await.unwrap();
            assert_single_primary(h.worker.status());
            now += 1;
            if report.converged {
                break;
            }
        }
        assert_eq!(h.worker.status().phase, ClusterPhase::Healthy);
        assert_eq!(h.worker.status().write_primary(), Some("orders-1"));
    }

    #[tokio::test]
    async fn missing_owner_secret_blocks_only_the_bootstrap() {
        let spec = spec(1);
        let mut h = harness(&spec, StaticCredentials::new());
        let report = h.worker.run_pass(0).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        let ann = &h.worker.status().annotations["create_instance/orders-1"];
        assert_eq!(ann.kind, "credential_unavailable");
        assert!(!ann.permanent);
        assert_eq!(h.worker.status().phase, ClusterPhase::Initializing);
    }

    #[tokio::test]
    async fn unavailable_restore_is_permanent_until_the_spec_changes() {
        let mut spec = spec(1);
        spec.bootstrap.recovery = Some(RecoverySource {
            source_cluster: "prod/legacy".to_string(),
            target_time: None,
        });
        let mut h = harness(&spec, creds());
        h.worker.run_pass(0).await.unwrap();
        let ann = h.worker.status().annotations["create_instance/orders-1"].clone();
        assert!(ann.permanent);
        assert_eq!(ann.kind, "restore_target_unavailable");

        // Long after any backoff, still not retried.
        let report = h.worker.run_pass(10_000).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);

        let mut fixed = spec.clone();
        fixed.bootstrap.recovery = None;
        fixed.generation = 2;
        h.store.put_spec(&fixed).unwrap();
        let report = h.worker.run_pass(10_001).await.unwrap();
        assert_eq!(report.failed, 0);
        assert!(h.worker.status().instance("orders-1").is_some());
    }

    #[tokio::test]
    async fn backups_start_once_writes_are_routed() {
        let mut spec = spec(1);
        spec.backup = Some(BackupSpec {
            destination_uri: "s3://backups".to_string(),
            credentials: SecretRef {
                name: "orders-s3".to_string(),
                key: "key".to_string(),
            },
            retention: "7d".to_string(),
        });
        let mut h = harness(&spec, creds());
        converge(&mut h, 0, 10).await;

        let status = h.worker.status();
        assert!(status.last_backup_at.is_some());
        assert_eq!(h.store.list_backups("prod/orders").unwrap().len(), 1);
        assert!(!h.objects.keys("s3://backups").await.is_empty());
    }
}
