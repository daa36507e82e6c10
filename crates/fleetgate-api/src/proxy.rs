//! Workload proxy middleware and the session cookie endpoints.
//!
//! Per request:
//!
//! 1. host is not a proxy host → next handler
//! 2. proxy host without a parseable alias → 404
//! 3. alias has no running balancer → 404
//! 4. identity cookies missing → 303 to the login flow
//! 5. access denied → 303 to the forbidden page
//! 6. otherwise → forwarded to the alias's reverse proxy

use axum::Json;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cookie::{
    IdentityCookies, identity_cookies, revoke_identity_cookies, set_identity_cookies,
    valid_cookie_value,
};
use crate::handlers::{ApiResponse, error_response};
use crate::host::HostMatch;
use crate::{ApiState, ProxySettings};

/// Value of the `flow` query parameter on login redirects.
pub const LOGIN_FLOW: &str = "workload-proxy";

pub async fn workload_proxy(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(host) = request_host(&req) else {
        return next.run(req).await;
    };

    let alias = match state.settings.hosts.classify(&host) {
        HostMatch::NotProxy => return next.run(req).await,
        HostMatch::Malformed => {
            debug!(%host, "malformed workload proxy host");
            return StatusCode::NOT_FOUND.into_response();
        }
        HostMatch::Alias(alias) => alias,
    };

    let Some((reverse_proxy, cluster_id)) = state.proxy.get_proxy(&alias) else {
        debug!(%host, %alias, "no workload proxy for alias");
        return StatusCode::NOT_FOUND.into_response();
    };

    let Some(cookies) = identity_cookies(req.headers()) else {
        let original = original_url(&req, &host, &state.settings);
        return Redirect::to(&login_url(&state.settings, &original)).into_response();
    };

    if state
        .validator
        .validate_access(&cookies.public_key_id, &cookies.signature_base64, &cluster_id)
        .await
        .is_err()
    {
        return Redirect::to(&forbidden_url(&state.settings)).into_response();
    }

    match reverse_proxy.forward(req).await {
        Ok(resp) => resp.map(Body::new),
        Err(e) => {
            warn!(%alias, %cluster_id, error = %e, "workload proxy forward failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

fn request_host(req: &Request) -> Option<String> {
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        return Some(host.to_string());
    }
    req.uri().authority().map(|a| a.as_str().to_string())
}

/// Absolute URL of the request as the browser sent it, port included.
fn original_url(req: &Request, host: &str, settings: &ProxySettings) -> String {
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().scheme_str())
        .filter(|s| matches!(*s, "http" | "https"))
        .unwrap_or_else(|| main_scheme(&settings.main_url));
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}{path}")
}

fn main_scheme(main_url: &str) -> &str {
    match main_url.split_once("://") {
        Some((scheme, _)) => scheme,
        None => "https",
    }
}

pub fn login_url(settings: &ProxySettings, original: &str) -> String {
    format!(
        "{}/authenticate?redirect={}&flow={LOGIN_FLOW}",
        settings.main_url.trim_end_matches('/'),
        urlencoding::encode(original),
    )
}

pub fn forbidden_url(settings: &ProxySettings) -> String {
    format!("{}/forbidden", settings.main_url.trim_end_matches('/'))
}

/// Session request body.
#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub public_key_id: String,
    pub signature_base64: String,
}

/// POST /api/v1/workload-proxy/session
pub async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<SessionRequest>,
) -> Response {
    if !valid_cookie_value(&req.public_key_id) || !valid_cookie_value(&req.signature_base64) {
        return error_response("invalid cookie value", StatusCode::BAD_REQUEST).into_response();
    }
    let cookies = IdentityCookies {
        public_key_id: req.public_key_id,
        signature_base64: req.signature_base64,
    };

    let mut headers = HeaderMap::new();
    if let Err(e) = set_identity_cookies(&mut headers, &state.settings.cookie_domain, &cookies) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }
    debug!(key_id = %cookies.public_key_id, "workload proxy session set");
    (headers, ApiResponse::ok("session established")).into_response()
}

/// POST /api/v1/workload-proxy/logout
pub async fn logout(State(state): State<ApiState>) -> Response {
    let mut headers = HeaderMap::new();
    if let Err(e) = revoke_identity_cookies(&mut headers, &state.settings.cookie_domain) {
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response();
    }
    (headers, ApiResponse::ok("session revoked")).into_response()
}
