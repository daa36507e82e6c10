//! REST API handlers.
//!
//! Resource handlers write through the `StateStore`; the store's change
//! feed drives the workload proxy. Diagnostics read the proxy directly.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use fleetgate_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_error(e: StateError) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

fn deleted(found: StateResult<bool>, what: &str) -> axum::response::Response {
    match found {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response(&format!("{what} not found"), StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

/// Fallback for unmatched paths.
pub async fn not_found() -> impl IntoResponse {
    error_response("not found", StatusCode::NOT_FOUND)
}

// ── Workload proxy diagnostics ─────────────────────────────────

/// GET /api/v1/workload-proxy/aliases
pub async fn list_aliases(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.proxy.aliases())
}

/// GET /api/v1/workload-proxy/clusters/:id
pub async fn cluster_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.proxy.cluster_status(&id) {
        Some(status) => ApiResponse::ok(status).into_response(),
        None => error_response("cluster not proxied", StatusCode::NOT_FOUND).into_response(),
    }
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_clusters() {
        Ok(clusters) => ApiResponse::ok(clusters).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/clusters/:id
pub async fn get_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_cluster(&id) {
        Ok(Some(cluster)) => ApiResponse::ok(cluster).into_response(),
        Ok(None) => error_response("cluster not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /api/v1/clusters/:id
pub async fn put_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut cluster): Json<ClusterRecord>,
) -> impl IntoResponse {
    cluster.id = id;
    match state.store.put_cluster(&cluster) {
        Ok(()) => ApiResponse::ok(cluster).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/clusters/:id
pub async fn delete_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    deleted(state.store.delete_cluster(&id), "cluster")
}

// ── Machines ───────────────────────────────────────────────────

/// PUT /api/v1/machines/:id
pub async fn put_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut machine): Json<MachineStatus>,
) -> impl IntoResponse {
    machine.id = id;
    match state.store.put_machine(&machine) {
        Ok(()) => ApiResponse::ok(machine).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/machines/:id
pub async fn delete_machine(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    deleted(state.store.delete_machine(&id), "machine")
}

// ── Exposed services ───────────────────────────────────────────

/// PUT /api/v1/services/:id
pub async fn put_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut service): Json<ExposedService>,
) -> impl IntoResponse {
    service.id = id;
    // Hostnames are matched case-insensitively, so aliases are stored lowercase.
    service.alias.make_ascii_lowercase();
    if service.alias.is_empty() || service.alias.contains(['-', '.']) {
        return error_response(
            "alias must be non-empty and contain no '-' or '.'",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    match state.store.put_service(&service) {
        Ok(()) => ApiResponse::ok(service).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/services/:id
pub async fn delete_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    deleted(state.store.delete_service(&id), "service")
}

// ── Keys and access ────────────────────────────────────────────

/// PUT /api/v1/public-keys/:id
pub async fn put_public_key(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut key): Json<PublicKeyRecord>,
) -> impl IntoResponse {
    key.id = id;
    match state.store.put_public_key(&key) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(key.id)).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/public-keys/:id
pub async fn delete_public_key(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    deleted(state.store.delete_public_key(&id), "public key")
}

/// PUT /api/v1/identities/:id
pub async fn put_identity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut identity): Json<IdentityRecord>,
) -> impl IntoResponse {
    identity.id = id;
    match state.store.put_identity(&identity) {
        Ok(()) => ApiResponse::ok(identity).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /api/v1/acl/:cluster
pub async fn put_acl(
    State(state): State<ApiState>,
    Path(cluster): Path<String>,
    Json(mut acl): Json<ClusterAcl>,
) -> impl IntoResponse {
    acl.cluster_id = cluster;
    match state.store.put_acl(&acl) {
        Ok(()) => ApiResponse::ok(acl).into_response(),
        Err(e) => store_error(e),
    }
}
