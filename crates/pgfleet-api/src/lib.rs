//! pgfleet-api — REST API for pgfleet.
//!
//! Exposes cluster status, role assignments and backups, accepts desired
//! state, and serves the write-target lookup used by the routing layer.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/clusters` | List cluster statuses |
//! | GET | `/api/v1/clusters/{ns}/{name}` | Spec and status |
//! | PUT | `/api/v1/clusters/{ns}/{name}` | Apply a spec |
//! | DELETE | `/api/v1/clusters/{ns}/{name}` | Delete a cluster |
//! | GET | `/api/v1/clusters/{ns}/{name}/write-target` | Current primary, 503 when none |
//! | GET | `/api/v1/clusters/{ns}/{name}/backups` | Completed backups |
//! | POST | `/api/v1/clusters/{ns}/{name}/restore-plan` | Point-in-time recovery plan |
//! | POST | `/api/v1/clusters/{ns}/{name}/resolve-split-brain` | Keep one claimant as primary |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use pgfleet_reconciler::ClusterControl;
use pgfleet_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub control: Arc<dyn ClusterControl>,
}

/// Build the API router.
pub fn build_router(store: StateStore, control: Arc<dyn ClusterControl>) -> Router {
    let state = ApiState { store, control };

    let api_routes = Router::new()
        .route("/clusters", get(handlers::list_clusters))
        .route(
            "/clusters/{ns}/{name}",
            get(handlers::get_cluster)
                .put(handlers::apply_cluster)
                .delete(handlers::delete_cluster),
        )
        .route("/clusters/{ns}/{name}/write-target", get(handlers::write_target))
        .route("/clusters/{ns}/{name}/backups", get(handlers::list_backups))
        .route("/clusters/{ns}/{name}/restore-plan", post(handlers::restore_plan))
        .route(
            "/clusters/{ns}/{name}/resolve-split-brain",
            post(handlers::resolve_split_brain),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
