//! Agent channel
//!
//! Agents authenticate with their enrollment token and hold one WebSocket.
//! The server writes compiled configuration; the agent writes heartbeats.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use netmesh_common::{now_epoch_secs, Error, Peer, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::meshnet::captive::CaptiveAuthRequest;
use crate::meshnet::distribution::{PeerKey, Registration};
use crate::meshnet::incident::{Heartbeat, HeartbeatEvent};
use crate::meshnet::routes::{extract_token, ApiError, ApiResult};
use crate::server::AppState;

/// Routes that do not take the admin token
pub fn agent_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/agent/ws", get(agent_ws_handler))
        .route("/api/agent/captive-token", post(issue_captive_token))
        .route("/api/captive/authenticate", post(captive_authenticate))
}

/// Run a database-bound call off the reactor
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

async fn authenticate(state: &Arc<AppState>, headers: &HeaderMap) -> ApiResult<Peer> {
    let token = extract_token(headers)
        .ok_or_else(|| ApiError(Error::Unauthorized("missing enrollment token".into())))?;
    let service = state.service.clone();
    Ok(blocking(move || service.authenticate_agent(&token)).await?)
}

async fn record_liveness(
    state: &Arc<AppState>,
    key: PeerKey,
    hostname: Option<String>,
    endpoint: Option<String>,
) -> Result<bool> {
    let service = state.service.clone();
    blocking(move || {
        service.touch_peer(
            key.network_id,
            key.peer_id,
            hostname.as_deref(),
            endpoint.as_deref(),
        )
    })
    .await
}

async fn agent_ws_handler(
    State(state): State<Arc<AppState>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = match authenticate(&state, &headers).await {
        Ok(peer) => peer,
        Err(e) => return e.into_response(),
    };
    let endpoint = remote.map(|ConnectInfo(addr)| addr.to_string());

    info!("Agent {} connecting from {:?}", peer.name, endpoint);
    ws.on_upgrade(move |socket| run_agent(state, peer, endpoint, socket))
}

async fn run_agent(state: Arc<AppState>, peer: Peer, endpoint: Option<String>, socket: WebSocket) {
    let key = PeerKey::new(peer.network_id, peer.id);
    if let Err(e) = record_liveness(&state, key, None, endpoint).await {
        warn!("Failed to record connection of peer {}: {}", peer.name, e);
    }

    let Registration {
        conn_id,
        mut updates,
        cancel,
    } = state.distribution.register(key).await;

    let (mut sink, mut stream) = socket.split();
    let push_timeout = state.config.push_timeout();
    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let payload = updates
                .borrow_and_update()
                .as_ref()
                .map(|push| push.payload.clone());
            if let Some(payload) = payload {
                match tokio::time::timeout(push_timeout, sink.send(Message::Text(payload.to_string()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Agent write failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!("Agent write timed out after {:?}", push_timeout);
                        return;
                    }
                }
            }

            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let idle = state.config.idle_timeout();
    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Agent connection for {} superseded or revoked", peer.name);
                break;
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            next = tokio::time::timeout(idle, stream.next()) => match next {
                Err(_) => {
                    info!("Agent {} idle for {:?}, closing", peer.name, idle);
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!("Agent {} read error: {}", peer.name, e);
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => handle_heartbeat(&state, key, &text).await,
                // Any other frame still counts as traffic
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    cancel.cancel();
    if !writer_done {
        let _ = writer.await;
    }
    state.distribution.unregister(key, conn_id).await;
    info!("Agent {} disconnected", peer.name);
}

async fn handle_heartbeat(state: &Arc<AppState>, key: PeerKey, text: &str) {
    let heartbeat: Heartbeat = match serde_json::from_str(text) {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            warn!("Dropping malformed heartbeat from peer {}: {}", key.peer_id, e);
            return;
        }
    };

    if let Err(e) = record_liveness(state, key, Some(heartbeat.hostname.clone()), None).await {
        warn!("Failed to record heartbeat of peer {}: {}", key.peer_id, e);
        return;
    }

    state.incidents.submit(HeartbeatEvent {
        network_id: key.network_id,
        reporter_id: key.peer_id,
        received_at: now_epoch_secs(),
        heartbeat,
    });
}

// ============================================================================
// Captive portal
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CaptiveTokenRequest {
    #[serde(default)]
    client_ip: Option<IpAddr>,
}

async fn issue_captive_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CaptiveTokenRequest>>,
) -> ApiResult<impl IntoResponse> {
    let peer = authenticate(&state, &headers).await?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let issued =
        blocking(move || state.captive.issue(peer.network_id, peer.id, req.client_ip)).await?;
    Ok(Json(issued))
}

async fn captive_authenticate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CaptiveAuthRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(blocking(move || state.captive.authenticate(&req)).await?))
}
