//! HTTP server wiring

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use netmesh_common::crypto::verify_token;
use netmesh_common::{now_epoch_secs, Database, Error};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::meshnet::agent::agent_router;
use crate::meshnet::routes::{admin_router, extract_token, ApiError};
use crate::meshnet::{
    CaptivePortal, CaptiveTokens, ChangeNotifier, DistributionManager, IncidentDispatcher,
    NetworkService, ServiceOptions, SqliteSessionStore, ThresholdDetector,
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state of every handler
pub struct AppState {
    pub config: Arc<ControlConfig>,
    pub service: Arc<NetworkService>,
    pub distribution: DistributionManager,
    pub incidents: IncidentDispatcher,
    pub captive: CaptivePortal,
    pub sessions: SqliteSessionStore,
}

/// Fans committed changes out to distribution and incident dispatch
struct ControlNotifier {
    distribution: DistributionManager,
    incidents: IncidentDispatcher,
}

impl ChangeNotifier for ControlNotifier {
    fn network_changed(&self, network_id: Uuid) {
        self.distribution.network_changed(network_id);
    }

    fn peer_changed(&self, network_id: Uuid, peer_id: Uuid) {
        self.distribution.peer_changed(network_id, peer_id);
    }

    fn peer_removed(&self, network_id: Uuid, peer_id: Uuid) {
        self.distribution.peer_removed(network_id, peer_id);
        self.incidents.remove_peer(peer_id);
    }

    fn network_removed(&self, network_id: Uuid) {
        self.distribution.network_removed(network_id);
        self.incidents.remove_network(network_id);
    }
}

/// The control plane server
pub struct ControlServer {
    state: Arc<AppState>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, db: Database) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let distribution = DistributionManager::new(db.clone(), config.compile_options());
        let incidents = IncidentDispatcher::new(
            db.clone(),
            Arc::new(ThresholdDetector::new(db.clone())),
            config.incidents.queue_capacity,
        );
        let notifier = Arc::new(ControlNotifier {
            distribution: distribution.clone(),
            incidents: incidents.clone(),
        });

        let service = Arc::new(NetworkService::new(
            db.clone(),
            ServiceOptions {
                compile: config.compile_options(),
                reserved_cidrs: config.reserved_cidrs()?,
                reserve_existing_networks: config.cidr.reserve_existing_networks,
            },
            notifier,
        ));

        let sessions = SqliteSessionStore::new(db, config.auth.session_ttl_secs);
        let captive = CaptivePortal::new(
            CaptiveTokens::new(config.captive_token_ttl()),
            service.clone(),
            Arc::new(sessions.clone()),
            config.auth.enabled,
        );

        Ok(Self {
            state: Arc::new(AppState {
                config,
                service,
                distribution,
                incidents,
                captive,
                sessions,
            }),
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Create router
    pub fn router(&self) -> Router {
        let admin = admin_router().layer(middleware::from_fn_with_state(
            self.state.clone(),
            require_admin,
        ));

        Router::new()
            .route("/healthz", get(health_handler))
            .merge(agent_router())
            .merge(admin)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self.state.config.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("netmesh control plane listening on http://{}", addr);

        let housekeeping = tokio::spawn(housekeeping(self.state.clone(), shutdown.clone()));

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        housekeeping.abort();
        info!("Control plane stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let agents = state.distribution.registry().connection_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": netmesh_common::VERSION,
        "connected_agents": agents,
        "pending_captive_tokens": state.captive.tokens().len(),
    }))
    .into_response()
}

async fn require_admin(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.config.admin_token.as_deref() {
        match extract_token(req.headers()) {
            Some(token) if verify_token(&token, expected) => {}
            Some(_) => {
                warn!("Rejected admin request with invalid token: {}", req.uri().path());
                return ApiError(Error::Unauthorized("invalid admin token".into())).into_response();
            }
            None => {
                return ApiError(Error::Unauthorized("admin token required".into())).into_response();
            }
        }
    }
    next.run(req).await
}

/// Periodically drop expired captive tokens, sessions and stale detector state
async fn housekeeping(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        sweep(&state).await;
    }
}

async fn sweep(state: &Arc<AppState>) {
    let tokens = state.captive.tokens().purge_expired();
    let history = state.incidents.prune(now_epoch_secs());

    let sessions = state.sessions.clone();
    let sessions = match tokio::task::spawn_blocking(move || sessions.purge_expired()).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            warn!("Session cleanup failed: {}", e);
            0
        }
        Err(e) => {
            warn!("Session cleanup task failed: {}", e);
            0
        }
    };
    if tokens > 0 || sessions > 0 || history > 0 {
        debug!(
            "Purged {} captive tokens, {} sessions and {} endpoint histories",
            tokens, sessions, history
        );
    }
}
