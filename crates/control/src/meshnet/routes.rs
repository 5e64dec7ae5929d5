//! Admin HTTP API
//!
//! Thin axum handlers over [`NetworkService`]. Every domain error is mapped
//! to a status code in [`ApiError`].
//!
//! [`NetworkService`]: crate::meshnet::service::NetworkService

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use netmesh_common::crypto::hash_token;
use netmesh_common::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::meshnet::service::{
    CreateDnsMapping, CreateGroup, CreateNetwork, CreatePeer, CreatePolicy, CreateRoute, RuleSpec,
    UpdateDnsMapping, UpdateGroup, UpdateNetwork, UpdatePeer, UpdatePolicy, UpdateRoute,
    UpdateSecurityConfig,
};
use crate::server::AppState;

// ============================================================================
// Errors
// ============================================================================

/// Domain error rendered as `{"error": ..., "kind": ...}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::InvalidOrder(_) => (StatusCode::BAD_REQUEST, "invalid_order"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Error::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            Error::CircularRouting { .. } => (StatusCode::CONFLICT, "circular_routing"),
            Error::ImmutableField { .. } => (StatusCode::CONFLICT, "immutable_field"),
            Error::InUse { .. } => (StatusCode::CONFLICT, "in_use"),
            Error::DnsMappingOutOfRange { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "dns_mapping_out_of_range")
            }
            Error::Capacity { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "capacity"),
            Error::Exhausted { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "exhausted"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = if self.0.is_client_error() {
            warn!("Request rejected: {}", self.0);
            self.0.to_string()
        } else {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        };
        (
            status,
            Json(serde_json::json!({ "error": message, "kind": kind })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub(crate) fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

// ============================================================================
// Router
// ============================================================================

/// Admin routes. The caller layers authentication on top.
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // Networks
        .route("/api/networks", post(create_network).get(list_networks))
        .route(
            "/api/networks/:nid",
            get(get_network).patch(update_network).delete(delete_network),
        )
        .route(
            "/api/networks/:nid/security",
            get(get_security).put(update_security),
        )
        .route("/api/networks/:nid/incidents", get(list_incidents))
        .route(
            "/api/networks/:nid/incidents/:iid/resolve",
            post(resolve_incident),
        )
        // Peers
        .route("/api/networks/:nid/peers", post(create_peer).get(list_peers))
        .route(
            "/api/networks/:nid/peers/:pid",
            get(get_peer).patch(update_peer).delete(delete_peer),
        )
        .route("/api/networks/:nid/peers/:pid/token", post(rotate_token))
        .route("/api/networks/:nid/peers/:pid/config", get(peer_config))
        .route("/api/networks/:nid/peers/:pid/whitelist", get(list_whitelist))
        .route(
            "/api/networks/:nid/peers/:pid/whitelist/:ip",
            delete(remove_whitelist),
        )
        // Groups
        .route("/api/networks/:nid/groups", post(create_group).get(list_groups))
        .route(
            "/api/networks/:nid/groups/:gid",
            get(get_group).patch(update_group).delete(delete_group),
        )
        .route(
            "/api/networks/:nid/groups/:gid/peers/:pid",
            put(add_group_peer).delete(remove_group_peer),
        )
        .route(
            "/api/networks/:nid/groups/:gid/policies",
            put(reorder_group_policies),
        )
        .route(
            "/api/networks/:nid/groups/:gid/policies/:polid",
            put(attach_group_policy).delete(detach_group_policy),
        )
        .route(
            "/api/networks/:nid/groups/:gid/routes/:rid",
            put(attach_group_route).delete(detach_group_route),
        )
        // Policies
        .route(
            "/api/networks/:nid/policies",
            post(create_policy).get(list_policies),
        )
        .route(
            "/api/networks/:nid/policies/:polid",
            get(get_policy).patch(update_policy).delete(delete_policy),
        )
        .route("/api/networks/:nid/policies/:polid/rules", post(add_rule))
        .route(
            "/api/networks/:nid/policies/:polid/rules/:ruleid",
            delete(remove_rule),
        )
        // Routes and DNS
        .route("/api/networks/:nid/routes", post(create_route).get(list_routes))
        .route(
            "/api/networks/:nid/routes/:rid",
            get(get_route).patch(update_route).delete(delete_route),
        )
        .route(
            "/api/networks/:nid/routes/:rid/dns",
            post(create_dns).get(list_dns),
        )
        .route(
            "/api/networks/:nid/routes/:rid/dns/:mid",
            axum::routing::patch(update_dns).delete(delete_dns),
        )
        // Allocation
        .route("/api/cidr/suggest", get(suggest_cidrs))
        // Users and sessions
        .route("/api/users", post(create_user))
        .route("/api/users/:uid/sessions", post(create_session))
        .route("/api/sessions", delete(revoke_session))
}

// ============================================================================
// Networks
// ============================================================================

async fn create_network(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateNetwork>,
) -> ApiResult<impl IntoResponse> {
    let network = state.service.create_network(req)?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn list_networks(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_networks()?))
}

async fn get_network(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_network(nid)?))
}

async fn update_network(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<UpdateNetwork>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_network(nid, req)?))
}

async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.service.delete_network(nid)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_security(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.security_config(nid)?))
}

async fn update_security(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<UpdateSecurityConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_security_config(nid, req)?))
}

async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_incidents(nid)?))
}

async fn resolve_incident(
    State(state): State<Arc<AppState>>,
    Path((nid, iid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.resolve_incident(nid, iid)?))
}

// ============================================================================
// Peers
// ============================================================================

async fn create_peer(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<CreatePeer>,
) -> ApiResult<impl IntoResponse> {
    let enrollment = state.service.create_peer(nid, req)?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn list_peers(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_peers(nid)?))
}

async fn get_peer(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_peer(nid, pid)?))
}

async fn update_peer(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdatePeer>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_peer(nid, pid, req)?))
}

async fn delete_peer(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete_peer(nid, pid)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct TokenResponse {
    enrollment_token: String,
}

async fn rotate_token(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let enrollment_token = state.service.rotate_peer_token(nid, pid)?;
    Ok(Json(TokenResponse { enrollment_token }))
}

async fn peer_config(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.compile_peer(nid, pid)?))
}

async fn list_whitelist(
    State(state): State<Arc<AppState>>,
    Path((nid, pid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_whitelist(nid, pid)?))
}

async fn remove_whitelist(
    State(state): State<Arc<AppState>>,
    Path((nid, pid, ip)): Path<(Uuid, Uuid, IpAddr)>,
) -> ApiResult<StatusCode> {
    state.service.remove_whitelist(nid, pid, ip)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Groups
// ============================================================================

async fn create_group(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<CreateGroup>,
) -> ApiResult<impl IntoResponse> {
    let group = state.service.create_group(nid, req)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_groups(nid)?))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path((nid, gid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_group(nid, gid)?))
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path((nid, gid)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateGroup>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_group(nid, gid, req)?))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path((nid, gid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete_group(nid, gid)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_group_peer(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, pid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.add_peer_to_group(nid, gid, pid)?))
}

async fn remove_group_peer(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, pid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.remove_peer_from_group(nid, gid, pid)?))
}

#[derive(Deserialize)]
struct ReorderRequest {
    policy_ids: Vec<Uuid>,
}

async fn reorder_group_policies(
    State(state): State<Arc<AppState>>,
    Path((nid, gid)): Path<(Uuid, Uuid)>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.reorder_policies(nid, gid, req.policy_ids)?))
}

async fn attach_group_policy(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, polid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.attach_policy(nid, gid, polid)?))
}

async fn detach_group_policy(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, polid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.detach_policy(nid, gid, polid)?))
}

async fn attach_group_route(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, rid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.attach_route(nid, gid, rid)?))
}

async fn detach_group_route(
    State(state): State<Arc<AppState>>,
    Path((nid, gid, rid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.detach_route(nid, gid, rid)?))
}

// ============================================================================
// Policies
// ============================================================================

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<CreatePolicy>,
) -> ApiResult<impl IntoResponse> {
    let policy = state.service.create_policy(nid, req)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list_policies(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_policies(nid)?))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path((nid, polid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_policy(nid, polid)?))
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Path((nid, polid)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdatePolicy>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_policy(nid, polid, req)?))
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path((nid, polid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete_policy(nid, polid)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_rule(
    State(state): State<Arc<AppState>>,
    Path((nid, polid)): Path<(Uuid, Uuid)>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<impl IntoResponse> {
    let policy = state.service.add_rule(nid, polid, spec)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn remove_rule(
    State(state): State<Arc<AppState>>,
    Path((nid, polid, ruleid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.remove_rule(nid, polid, ruleid)?))
}

// ============================================================================
// Routes and DNS mappings
// ============================================================================

async fn create_route(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
    Json(req): Json<CreateRoute>,
) -> ApiResult<impl IntoResponse> {
    let route = state.service.create_route(nid, req)?;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn list_routes(
    State(state): State<Arc<AppState>>,
    Path(nid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_routes(nid)?))
}

async fn get_route(
    State(state): State<Arc<AppState>>,
    Path((nid, rid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_route(nid, rid)?))
}

async fn update_route(
    State(state): State<Arc<AppState>>,
    Path((nid, rid)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateRoute>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_route(nid, rid, req)?))
}

async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path((nid, rid)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete_route(nid, rid)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_dns(
    State(state): State<Arc<AppState>>,
    Path((nid, rid)): Path<(Uuid, Uuid)>,
    Json(req): Json<CreateDnsMapping>,
) -> ApiResult<impl IntoResponse> {
    let mapping = state.service.create_dns_mapping(nid, rid, req)?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn list_dns(
    State(state): State<Arc<AppState>>,
    Path((nid, rid)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_dns_mappings(nid, rid)?))
}

async fn update_dns(
    State(state): State<Arc<AppState>>,
    Path((nid, rid, mid)): Path<(Uuid, Uuid, Uuid)>,
    Json(req): Json<UpdateDnsMapping>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.update_dns_mapping(nid, rid, mid, req)?))
}

async fn delete_dns(
    State(state): State<Arc<AppState>>,
    Path((nid, rid, mid)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete_dns_mapping(nid, rid, mid)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// CIDR suggestion
// ============================================================================

#[derive(Deserialize)]
struct SuggestQuery {
    base_cidr: String,
    max_peers: u64,
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    1
}

async fn suggest_cidrs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SuggestQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.suggest_cidrs(&q.base_cidr, q.max_peers, q.count)?))
}

// ============================================================================
// Users and sessions
// ============================================================================

#[derive(Deserialize)]
struct CreateUserRequest {
    name: String,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    authorized_networks: BTreeSet<Uuid>,
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = state
        .sessions
        .create_user(&req.name, req.is_admin, req.authorized_networks)?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Serialize)]
struct SessionResponse {
    token: String,
    /// What the captive portal presents as `session_hash`
    session_hash: String,
    expires_in: u64,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let token = state.sessions.create_session(uid)?;
    let session_hash = hash_token(&token);
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token,
            session_hash,
            expires_in: state.config.auth.session_ttl_secs,
        }),
    ))
}

#[derive(Deserialize)]
struct RevokeRequest {
    token: String,
}

async fn revoke_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<StatusCode> {
    state.sessions.revoke(&req.token)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::validation("bad"), StatusCode::BAD_REQUEST),
            (Error::InvalidOrder("x".into()), StatusCode::BAD_REQUEST),
            (Error::not_found("group", Uuid::nil()), StatusCode::NOT_FOUND),
            (
                Error::CircularRouting {
                    group: "g".into(),
                    route: "r".into(),
                    peer: "p".into(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::immutable("group quarantine", "priority"), StatusCode::CONFLICT),
            (
                Error::Capacity {
                    requested: 300,
                    available: 254,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.is_client_error(), status != StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert!(extract_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(extract_token(&headers).as_deref(), Some("abc123"));
        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(extract_token(&headers).is_none());
    }
}
