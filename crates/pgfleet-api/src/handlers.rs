//! REST API handlers.
//!
//! Reads go to the `StateStore` or the latest published status; writes go
//! through the controller so they reach the owning cluster loop.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use pgfleet_backup::{BackupError, plan_restore};
use pgfleet_reconciler::ReconcileError;
use pgfleet_state::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

fn reconcile_error(e: ReconcileError) -> axum::response::Response {
    let status = match &e {
        ReconcileError::State(StateError::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
        ReconcileError::UnknownCluster(_) => StatusCode::NOT_FOUND,
        ReconcileError::Rejected(_) | ReconcileError::SplitBrainRisk(_) => StatusCode::CONFLICT,
        ReconcileError::RestoreTargetUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::TransientInfra(_) | ReconcileError::Stopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

fn cluster_id(ns: &str, name: &str) -> ClusterId {
    format!("{ns}/{name}")
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_statuses() {
        Ok(statuses) => ApiResponse::ok(statuses).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Serialize)]
struct ClusterView {
    spec: ClusterSpec,
    status: Option<ClusterStatus>,
}

/// GET /api/v1/clusters/{ns}/{name}
pub async fn get_cluster(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = cluster_id(&ns, &name);
    let spec = match state.store.get_spec(&id) {
        Ok(Some(spec)) => spec,
        Ok(None) => return error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => return internal(e),
    };
    match state.control.status(&id).await {
        Ok(status) => ApiResponse::ok(ClusterView { spec, status }).into_response(),
        Err(e) => reconcile_error(e),
    }
}

/// PUT /api/v1/clusters/{ns}/{name}
pub async fn apply_cluster(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Json(spec): Json<ClusterSpec>,
) -> impl IntoResponse {
    if spec.namespace != ns || spec.name != name {
        return error_response(
            &format!("body names {} but path names {ns}/{name}", spec.id()),
            StatusCode::BAD_REQUEST,
        );
    }
    match state.control.apply(spec).await {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => reconcile_error(e),
    }
}

/// DELETE /api/v1/clusters/{ns}/{name}
pub async fn delete_cluster(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.control.delete(&cluster_id(&ns, &name)).await {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => reconcile_error(e),
    }
}

// ── Routing ────────────────────────────────────────────────────

#[derive(Serialize)]
struct WriteTargetView {
    primary: InstanceId,
}

/// GET /api/v1/clusters/{ns}/{name}/write-target
///
/// 503 while the cluster has no routed primary; callers must not fall back
/// to a primary they saw earlier.
pub async fn write_target(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.control.status(&cluster_id(&ns, &name)).await {
        Ok(Some(status)) => match status.write_target {
            WriteTarget::Primary { instance } => {
                ApiResponse::ok(WriteTargetView { primary: instance }).into_response()
            }
            WriteTarget::Unavailable { reason } => {
                error_response(&reason, StatusCode::SERVICE_UNAVAILABLE)
            }
        },
        Ok(None) => error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => reconcile_error(e),
    }
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub keep: InstanceId,
}

/// POST /api/v1/clusters/{ns}/{name}/resolve-split-brain
pub async fn resolve_split_brain(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Json(req): Json<ResolveRequest>,
) -> impl IntoResponse {
    match state
        .control
        .resolve_split_brain(&cluster_id(&ns, &name), &req.keep)
        .await
    {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "primary": req.keep })).into_response(),
        Err(e) => reconcile_error(e),
    }
}

// ── Backups ────────────────────────────────────────────────────

/// GET /api/v1/clusters/{ns}/{name}/backups
pub async fn list_backups(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.list_backups(&cluster_id(&ns, &name)) {
        Ok(backups) => ApiResponse::ok(backups).into_response(),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
pub struct RestorePlanRequest {
    /// Unix timestamp to recover to; now when omitted.
    pub target_time: Option<u64>,
}

/// POST /api/v1/clusters/{ns}/{name}/restore-plan
pub async fn restore_plan(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Json(req): Json<RestorePlanRequest>,
) -> impl IntoResponse {
    let id = cluster_id(&ns, &name);
    let records = state
        .store
        .list_backups(&id)
        .and_then(|b| Ok((b, state.store.list_wal_segments(&id)?)));
    let (backups, segments) = match records {
        Ok(records) => records,
        Err(e) => return internal(e),
    };

    let target = req.target_time.unwrap_or_else(epoch_secs);
    match plan_restore(&backups, &segments, target) {
        Ok(plan) => ApiResponse::ok(plan).into_response(),
        Err(e @ BackupError::RestoreTargetUnavailable { .. }) => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(e) => internal(e),
    }
}
