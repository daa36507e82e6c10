//! fleetgate-api — HTTP surface of the fleetgate daemon.
//!
//! Requests for workload proxy hostnames are intercepted by the
//! [`proxy::workload_proxy`] middleware and forwarded to the exposed
//! service; every other request reaches the REST routes below.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/workload-proxy/session` | Set identity cookies |
//! | POST | `/api/v1/workload-proxy/logout` | Revoke identity cookies |
//! | GET | `/api/v1/workload-proxy/aliases` | List indexed aliases |
//! | GET | `/api/v1/workload-proxy/clusters/{id}` | Hosts, in-use port, backend health |
//! | GET | `/api/v1/clusters` | List clusters |
//! | PUT/DELETE | `/api/v1/clusters/{id}` | Upsert / delete a cluster |
//! | PUT/DELETE | `/api/v1/machines/{id}` | Upsert / delete a machine status |
//! | PUT/DELETE | `/api/v1/services/{id}` | Upsert / delete an exposed service |
//! | PUT/DELETE | `/api/v1/public-keys/{id}` | Register / remove a public key |
//! | PUT | `/api/v1/identities/{id}` | Set an identity's base role |
//! | PUT | `/api/v1/acl/{cluster}` | Replace a cluster's role grants |

pub mod cookie;
pub mod handlers;
pub mod host;
pub mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};

use fleetgate_auth::AccessValidator;
use fleetgate_proxy::WorkloadProxy;
use fleetgate_state::StateStore;

use crate::host::HostPatterns;

/// Workload proxy settings used by the middleware and session routes.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Base URL of the main site, hosting `/authenticate` and `/forbidden`.
    pub main_url: String,
    pub hosts: HostPatterns,
    /// `Domain` attribute of the identity cookies.
    pub cookie_domain: String,
}

/// Shared state for the router and middleware.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub proxy: Arc<WorkloadProxy>,
    pub validator: AccessValidator,
    pub settings: Arc<ProxySettings>,
}

/// Build the complete router: REST routes behind the workload proxy
/// middleware.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/workload-proxy/session", post(proxy::create_session))
        .route("/workload-proxy/logout", post(proxy::logout))
        .route("/workload-proxy/aliases", get(handlers::list_aliases))
        .route("/workload-proxy/clusters/{id}", get(handlers::cluster_status))
        .route("/clusters", get(handlers::list_clusters))
        .route(
            "/clusters/{id}",
            get(handlers::get_cluster)
                .put(handlers::put_cluster)
                .delete(handlers::delete_cluster),
        )
        .route(
            "/machines/{id}",
            put(handlers::put_machine).delete(handlers::delete_machine),
        )
        .route(
            "/services/{id}",
            put(handlers::put_service).delete(handlers::delete_service),
        )
        .route(
            "/public-keys/{id}",
            put(handlers::put_public_key).delete(handlers::delete_public_key),
        )
        .route("/identities/{id}", put(handlers::put_identity))
        .route("/acl/{cluster}", put(handlers::put_acl))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state, proxy::workload_proxy))
}
