//! Standalone mode: controller, simulated platform and API in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use pgfleet_core::FleetConfig;
use pgfleet_infra::sim::{MemoryObjectStore, SimulatedInfrastructure, StaticCredentials};
use pgfleet_reconciler::Controller;
use pgfleet_state::StateStore;
use tracing::{error, info};

use crate::manifest;

pub struct StandaloneOptions {
    pub config: Option<PathBuf>,
    pub manifests: Option<PathBuf>,
    pub secrets: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub in_memory: bool,
}

pub async fn run_standalone(opts: StandaloneOptions) -> anyhow::Result<()> {
    info!("pgfleet daemon starting in standalone mode");

    let mut config = match &opts.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    if let Some(dir) = opts.data_dir {
        config.state.data_dir = dir;
    }
    if let Some(port) = opts.port {
        config.api.listen.set_port(port);
    }
    config.validate()?;

    // ── Resource store ─────────────────────────────────────────

    let store = if opts.in_memory {
        info!("state store kept in memory");
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.state.data_dir)?;
        let db_path = config.state.data_dir.join("pgfleet.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    // ── Platform ───────────────────────────────────────────────

    let credentials = match &opts.secrets {
        Some(path) => manifest::load_secrets(path)?,
        None => StaticCredentials::new(),
    };
    let infra = Arc::new(SimulatedInfrastructure::new());
    let objects = Arc::new(MemoryObjectStore::new());
    info!("simulated platform initialized");

    // ── Controller ─────────────────────────────────────────────

    let listen: SocketAddr = config.api.listen;
    let controller = Arc::new(Controller::new(
        store.clone(),
        infra,
        objects,
        Arc::new(credentials),
        config,
    ));
    let resumed = controller.start().await?;
    info!(resumed, "stored clusters resumed");

    if let Some(dir) = &opts.manifests {
        for spec in manifest::load_manifests(dir)? {
            let id = spec.id();
            let stored = controller.apply_spec(spec).await?;
            info!(cluster = %id, generation = stored.generation, "manifest applied");
        }
    }

    // ── API server ─────────────────────────────────────────────

    let router = pgfleet_api::build_router(store, controller.clone());
    info!(addr = %listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    controller.shutdown().await;
    info!("pgfleet daemon stopped");
    Ok(())
}
