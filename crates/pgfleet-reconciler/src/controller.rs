//! Controller: owns one reconcile loop per managed cluster.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pgfleet_core::FleetConfig;
use pgfleet_infra::{CredentialSource, InfraErrorKind, Infrastructure, ObjectStore};
use pgfleet_state::{ClusterId, ClusterSpec, ClusterStatus, StateStore};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterWorker, Command, LoopChannels, run_cluster_loop};
use crate::error::{ReconcileError, ReconcileResult};

/// Boxed future alias for control-plane calls.
pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = ReconcileResult<T>> + Send + 'a>>;

/// Control-plane surface consumed by the API layer.
pub trait ClusterControl: Send + Sync {
    /// Store a desired state and make sure its loop runs. Returns the
    /// stored spec with its generation.
    fn apply<'a>(&'a self, spec: ClusterSpec) -> ControlFuture<'a, ClusterSpec>;

    /// Tear a cluster down. `false` if it was not managed.
    fn delete<'a>(&'a self, cluster_id: &'a str) -> ControlFuture<'a, bool>;

    fn resolve_split_brain<'a>(
        &'a self,
        cluster_id: &'a str,
        keep: &'a str,
    ) -> ControlFuture<'a, ()>;

    fn status<'a>(&'a self, cluster_id: &'a str) -> ControlFuture<'a, Option<ClusterStatus>>;
}

/// Running loop of one cluster.
struct ClusterHandle {
    triggers: mpsc::Sender<()>,
    commands: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    status: watch::Receiver<ClusterStatus>,
    handle: JoinHandle<()>,
}

impl ClusterHandle {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "reconcile loop ended abnormally");
        }
    }
}

pub struct Controller {
    store: StateStore,
    infra: Arc<dyn Infrastructure>,
    objects: Arc<dyn ObjectStore>,
    credentials: Arc<dyn CredentialSource>,
    config: FleetConfig,
    clusters: RwLock<HashMap<ClusterId, ClusterHandle>>,
}

impl Controller {
    pub fn new(
        store: StateStore,
        infra: Arc<dyn Infrastructure>,
        objects: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialSource>,
        config: FleetConfig,
    ) -> Self {
        Self {
            store,
            infra,
            objects,
            credentials,
            config,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Resume a loop for every stored spec.
    pub async fn start(&self) -> ReconcileResult<usize> {
        let specs = self.store.list_specs()?;
        let mut clusters = self.clusters.write().await;
        for spec in &specs {
            let id = spec.id();
            if !clusters.contains_key(&id) {
                let handle = self.spawn(&id)?;
                clusters.insert(id, handle);
            }
        }
        info!(clusters = specs.len(), "controller started");
        Ok(specs.len())
    }

    /// Record a desired-state change. The generation is bumped only when
    /// the spec actually differs from the stored one.
    pub async fn apply_spec(&self, mut spec: ClusterSpec) -> ReconcileResult<ClusterSpec> {
        spec.validate()?;
        let id = spec.id();

        let mut clusters = self.clusters.write().await;
        match self.store.get_spec(&id)? {
            Some(current) => {
                spec.generation = current.generation;
                if spec != current {
                    spec.generation += 1;
                    self.store.put_spec(&spec)?;
                    info!(cluster = %id, generation = spec.generation, "desired state changed");
                }
            }
            None => {
                spec.generation = 1;
                self.store.put_spec(&spec)?;
                info!(cluster = %id, "cluster registered");
            }
        }

        match clusters.get(&id) {
            Some(handle) => trigger(handle),
            None => {
                let handle = self.spawn(&id)?;
                clusters.insert(id, handle);
            }
        }
        Ok(spec)
    }

    /// Request a pass, e.g. after an observed-state change. Coalesces with
    /// any pass already pending.
    pub async fn notify(&self, cluster_id: &str) -> bool {
        match self.clusters.read().await.get(cluster_id) {
            Some(handle) => {
                trigger(handle);
                true
            }
            None => false,
        }
    }

    pub async fn delete_cluster(&self, cluster_id: &str) -> ReconcileResult<bool> {
        let handle = self.clusters.write().await.remove(cluster_id);
        let known = handle.is_some() || self.store.get_spec(cluster_id)?.is_some();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        if !known {
            return Ok(false);
        }

        if let Some(status) = self.store.get_status(cluster_id)? {
            for inst in &status.instances {
                if let Err(e) = self.infra.delete_instance(cluster_id, &inst.id).await {
                    warn!(cluster = %cluster_id, instance = %inst.id, error = %e, "instance teardown failed");
                }
            }
            for id in status.volumes.keys() {
                match self.infra.delete_volume(cluster_id, id).await {
                    Ok(()) => {}
                    Err(e) if e.kind == InfraErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(cluster = %cluster_id, instance = %id, error = %e, "volume teardown failed");
                    }
                }
            }
        }
        self.store.delete_cluster(cluster_id)?;
        info!(cluster = %cluster_id, "cluster deleted");
        Ok(true)
    }

    pub async fn resolve_split_brain(&self, cluster_id: &str, keep: &str) -> ReconcileResult<()> {
        let commands = self
            .clusters
            .read()
            .await
            .get(cluster_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| ReconcileError::UnknownCluster(cluster_id.to_string()))?;

        let (reply, response) = oneshot::channel();
        commands
            .send(Command::ResolveSplitBrain {
                keep: keep.to_string(),
                reply,
            })
            .await
            .map_err(|_| ReconcileError::Stopped)?;
        response.await.map_err(|_| ReconcileError::Stopped)?
    }

    /// Latest published status, falling back to the store for clusters
    /// without a running loop.
    pub async fn status(&self, cluster_id: &str) -> ReconcileResult<Option<ClusterStatus>> {
        if let Some(handle) = self.clusters.read().await.get(cluster_id) {
            return Ok(Some(handle.status.borrow().clone()));
        }
        Ok(self.store.get_status(cluster_id)?)
    }

    /// Subscribe to status updates of a running cluster.
    pub async fn watch(&self, cluster_id: &str) -> Option<watch::Receiver<ClusterStatus>> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .map(|h| h.status.clone())
    }

    pub async fn running(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.clusters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every loop, letting in-flight passes finish.
    pub async fn shutdown(&self) {
        let handles: Vec<(ClusterId, ClusterHandle)> =
            self.clusters.write().await.drain().collect();
        for (id, handle) in handles {
            handle.stop().await;
            debug!(cluster = %id, "reconcile loop stopped");
        }
        info!("controller stopped");
    }

    fn spawn(&self, cluster_id: &str) -> ReconcileResult<ClusterHandle> {
        let worker = ClusterWorker::new(
            cluster_id,
            &self.config,
            self.store.clone(),
            self.infra.clone(),
            self.objects.clone(),
            self.credentials.clone(),
        )?;
        let status = worker.subscribe();
        let (triggers, trigger_rx) = mpsc::channel(1);
        let (commands, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_cluster_loop(
            worker,
            self.config.controller.clone(),
            LoopChannels {
                triggers: trigger_rx,
                commands: command_rx,
                shutdown: shutdown_rx,
            },
        ));
        info!(cluster = %cluster_id, "reconcile loop spawned");
        Ok(ClusterHandle {
            triggers,
            commands,
            shutdown_tx,
            status,
            handle,
        })
    }
}

fn trigger(handle: &ClusterHandle) {
    // A full channel already holds a pending pass.
    let _ = handle.triggers.try_send(());
}

impl ClusterControl for Controller {
    fn apply<'a>(&'a self, spec: ClusterSpec) -> ControlFuture<'a, ClusterSpec> {
        Box::pin(self.apply_spec(spec))
    }

    fn delete<'a>(&'a self, cluster_id: &'a str) -> ControlFuture<'a, bool> {
        Box::pin(self.delete_cluster(cluster_id))
    }

    fn resolve_split_brain<'a>(
        &'a self,
        cluster_id: &'a str,
        keep: &'a str,
    ) -> ControlFuture<'a, ()> {
        Box::pin(Controller::resolve_split_brain(self, cluster_id, keep))
    }

    fn status<'a>(&'a self, cluster_id: &'a str) -> ControlFuture<'a, Option<ClusterStatus>> {
        Box::pin(Controller::status(self, cluster_id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pgfleet_infra::sim::{MemoryObjectStore, SimulatedInfrastructure, StaticCredentials};
    use pgfleet_infra::{InfraFuture, InstanceObservation};
    use pgfleet_state::{
        BootstrapSpec, ClusterPhase, ResourceLimits, SecretRef, StateError, StorageSpec,
    };
    use tokio::sync::Semaphore;

    use super::*;

    fn spec(instances: u32) -> ClusterSpec {
        named("orders", instances)
    }

    fn named(name: &str, instances: u32) -> ClusterSpec {
        ClusterSpec {
            namespace: "prod".to_string(),
            name: name.to_string(),
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
                    name: format!("{name}-app"),
                    key: "password".to_string(),
                },
                recovery: None,
            },
            backup: None,
            generation: 0,
        }
    }

    fn controller() -> (Controller, Arc<SimulatedInfrastructure>) {
        let infra = Arc::new(SimulatedInfrastructure::new());
        let mut config = FleetConfig::default();
        config.replication.lag_debounce = Duration::ZERO;
        config.controller.requeue_interval = Duration::from_millis(10);
        config.controller.resync_interval = Duration::from_millis(50);
        let controller = Controller::new(
            StateStore::open_in_memory().unwrap(),
            infra.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(
                StaticCredentials::new()
                    .with("orders-app", "password", "pw")
                    .with("billing-app", "password", "pw"),
            ),
            config,
        );
        (controller, infra)
    }

    /// Counts passes by their observe call and parks each one until a
    /// permit is released.
    struct GatedObserve {
        inner: SimulatedInfrastructure,
        gate: Semaphore,
        observed: AtomicUsize,
    }

    impl Infrastructure for GatedObserve {
        fn create_volume<'a>(
            &'a self,
            cluster: &'a str,
            instance: &'a str,
            size_bytes: u64,
            storage_class: Option<&'a str>,
        ) -> InfraFuture<'a, ()> {
            self.inner
                .create_volume(cluster, instance, size_bytes, storage_class)
        }
        fn expand_volume<'a>(&'a self, c: &'a str, i: &'a str, s: u64) -> InfraFuture<'a, ()> {
            self.inner.expand_volume(c, i, s)
        }
        fn delete_volume<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, ()> {
            self.inner.delete_volume(c, i)
        }
        fn create_instance<'a>(&'a self, r: &'a pgfleet_infra::InstanceRequest) -> InfraFuture<'a, ()> {
            self.inner.create_instance(r)
        }
        fn update_instance<'a>(
            &'a self,
            c: &'a str,
            i: &'a str,
            u: &'a pgfleet_infra::InstanceUpdate,
        ) -> InfraFuture<'a, ()> {
            self.inner.update_instance(c, i, u)
        }
        fn delete_instance<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, ()> {
            self.inner.delete_instance(c, i)
        }
        fn fence<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, ()> {
            self.inner.fence(c, i)
        }
        fn unfence<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, ()> {
            self.inner.unfence(c, i)
        }
        fn promote<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, ()> {
            self.inner.promote(c, i)
        }
        fn observe<'a>(&'a self, c: &'a str) -> InfraFuture<'a, Vec<InstanceObservation>> {
            Box::pin(async move {
                self.observed.fetch_add(1, Ordering::SeqCst);
                let _permit = self.gate.acquire().await.unwrap();
                self.inner.observe(c).await
            })
        }
        fn base_backup<'a>(&'a self, c: &'a str, i: &'a str) -> InfraFuture<'a, pgfleet_infra::BaseBackup> {
            self.inner.base_backup(c, i)
        }
        fn fetch_wal<'a>(
            &'a self,
            c: &'a str,
            i: &'a str,
            from: u64,
        ) -> InfraFuture<'a, Option<pgfleet_infra::WalChunk>> {
            self.inner.fetch_wal(c, i, from)
        }
    }

    async fn wait_for(
        controller: &Controller,
        id: &str,
        pred: impl Fn(&ClusterStatus) -> bool,
    ) -> ClusterStatus {
        let mut rx = controller.watch(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn apply_bumps_generation_only_on_change() {
        let (controller, _) = controller();
        let first = controller.apply_spec(spec(1)).await.unwrap();
        assert_eq!(first.generation, 1);
        let same = controller.apply_spec(spec(1)).await.unwrap();
        assert_eq!(same.generation, 1);
        let scaled = controller.apply_spec(spec(2)).await.unwrap();
        assert_eq!(scaled.generation, 2);
        assert_eq!(controller.running().await, vec!["prod/orders"]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_before_storing() {
        let (controller, _) = controller();
        let err = controller.apply_spec(spec(0)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::State(StateError::InvalidSpec(_))));
        assert!(controller.store().get_spec("prod/orders").unwrap().is_none());
        assert!(controller.running().await.is_empty());
    }

    #[tokio::test]
    async fn cluster_loop_converges_and_delete_tears_down() {
        let (controller, infra) = controller();
        controller.apply_spec(spec(2)).await.unwrap();

        let status = wait_for(&controller, "prod/orders", |s| {
            s.phase == ClusterPhase::Healthy
        })
        .await;
        assert_eq!(status.write_primary(), Some("orders-1"));
        assert_eq!(infra.instance_ids("prod/orders").await.len(), 2);

        assert!(controller.delete_cluster("prod/orders").await.unwrap());
        assert!(infra.instance_ids("prod/orders").await.is_empty());
        assert!(infra.volume_ids("prod/orders").await.is_empty());
        assert!(controller.status("prod/orders").await.unwrap().is_none());
        assert!(!controller.delete_cluster("prod/orders").await.unwrap());
    }

    #[tokio::test]
    async fn start_resumes_stored_clusters() {
        let (controller, _) = controller();
        let mut stored = spec(1);
        stored.generation = 1;
        controller.store().put_spec(&stored).unwrap();

        assert_eq!(controller.start().await.unwrap(), 1);
        let status = wait_for(&controller, "prod/orders", |s| s.is_settled()).await;
        assert_eq!(status.primary_count(), 1);
        controller.shutdown().await;
        assert!(controller.running().await.is_empty());
    }

    #[tokio::test]
    async fn resolve_on_unknown_cluster_fails() {
        let (controller, _) = controller();
        let err = controller
            .resolve_split_brain("prod/missing", "missing-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownCluster(_)));
    }

    #[tokio::test]
    async fn triggers_during_a_pass_coalesce_into_one() {
        let infra = Arc::new(GatedObserve {
            inner: SimulatedInfrastructure::new(),
            gate: Semaphore::new(0),
            observed: AtomicUsize::new(0),
        });
        let mut config = FleetConfig::default();
        // Only triggers start passes within the test.
        config.controller.requeue_interval = Duration::from_secs(3600);
        config.controller.resync_interval = Duration::from_secs(3600);
        let controller = Controller::new(
            StateStore::open_in_memory().unwrap(),
            infra.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(StaticCredentials::new().with("orders-app", "password", "pw")),
            config,
        );

        controller.apply_spec(spec(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while infra.observed.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // The first pass is parked inside observe.
        for _ in 0..20 {
            assert!(controller.notify("prod/orders").await);
        }
        infra.gate.add_permits(1);

        wait_for(&controller, "prod/orders", |s| s.updated_at > 0).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while infra.observed.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(infra.observed.load(Ordering::SeqCst), 2);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn cluster_loops_run_independently() {
        let (controller, infra) = controller();
        controller.apply_spec(spec(2)).await.unwrap();
        controller.apply_spec(named("billing", 1)).await.unwrap();
        assert_eq!(controller.running().await, vec!["prod/billing", "prod/orders"]);

        let healthy = |s: &ClusterStatus| s.phase == ClusterPhase::Healthy;
        wait_for(&controller, "prod/orders", healthy).await;
        let billing = wait_for(&controller, "prod/billing", healthy).await;
        assert_eq!(billing.write_primary(), Some("billing-1"));

        // Losing the only billing instance leaves orders untouched.
        infra.crash("prod/billing", "billing-1").await;
        wait_for(&controller, "prod/billing", |s| s.phase != ClusterPhase::Healthy).await;
        let orders = controller.status("prod/orders").await.unwrap().unwrap();
        assert_eq!(orders.phase, ClusterPhase::Healthy);
        assert_eq!(orders.write_primary(), Some("orders-1"));

        assert!(controller.delete_cluster("prod/billing").await.unwrap());
        assert!(infra.instance_ids("prod/billing").await.is_empty());
        assert!(!controller.notify("prod/billing").await);
        assert_eq!(controller.running().await, vec!["prod/orders"]);

        // The surviving loop still acts on new desired state.
        controller.apply_spec(spec(3)).await.unwrap();
        let orders = wait_for(&controller, "prod/orders", |s| {
            s.phase == ClusterPhase::Healthy && s.live_instances().count() == 3
        })
        .await;
        assert_eq!(orders.write_primary(), Some("orders-1"));
        assert_eq!(infra.instance_ids("prod/orders").await.len(), 3);

        controller.shutdown().await;
    }
}
