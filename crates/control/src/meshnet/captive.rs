//! Captive-portal flow
//!
//! A jump peer's agent asks for a one-time token on behalf of a local client
//! that has not joined the mesh. The client presents that token (and, when
//! network authentication is on, a session) to `authenticate`, which
//! whitelists its address on the gateway.

use crate::meshnet::auth::SessionStore;
use crate::meshnet::service::NetworkService;
use dashmap::DashMap;
use netmesh_common::crypto::generate_token;
use netmesh_common::{Error, Result, WhitelistEntry};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct PendingToken {
    network_id: Uuid,
    jump_peer_id: Uuid,
    client_ip: Option<IpAddr>,
    expires_at: Instant,
}

/// Issued token as returned to the gateway agent
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// In-memory single-use token store
#[derive(Clone)]
pub struct CaptiveTokens {
    tokens: Arc<DashMap<String, PendingToken>>,
    ttl: Duration,
}

impl CaptiveTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn issue(&self, network_id: Uuid, jump_peer_id: Uuid, client_ip: Option<IpAddr>) -> IssuedToken {
        let token = generate_token();
        self.tokens.insert(
            token.clone(),
            PendingToken {
                network_id,
                jump_peer_id,
                client_ip,
                expires_at: Instant::now() + self.ttl,
            },
        );
        IssuedToken {
            token,
            expires_in: self.ttl.as_secs(),
        }
    }

    /// Remove and return a live token
    fn take(&self, token: &str) -> Option<PendingToken> {
        let (_, pending) = self.tokens.remove(token)?;
        (pending.expires_at > Instant::now()).then_some(pending)
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, pending| pending.expires_at > now);
        before.saturating_sub(self.tokens.len())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for CaptiveTokens {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptiveAuthRequest {
    pub captive_token: String,
    #[serde(default)]
    pub session_hash: Option<String>,
    pub peer_ip: IpAddr,
}

pub struct CaptivePortal {
    tokens: CaptiveTokens,
    service: Arc<NetworkService>,
    sessions: Arc<dyn SessionStore>,
    auth_enabled: bool,
}

impl CaptivePortal {
    pub fn new(
        tokens: CaptiveTokens,
        service: Arc<NetworkService>,
        sessions: Arc<dyn SessionStore>,
        auth_enabled: bool,
    ) -> Self {
        Self {
            tokens,
            service,
            sessions,
            auth_enabled,
        }
    }

    pub fn tokens(&self) -> &CaptiveTokens {
        &self.tokens
    }

    /// Issue a token for a jump peer
    pub fn issue(&self, network_id: Uuid, jump_peer_id: Uuid, client_ip: Option<IpAddr>) -> Result<IssuedToken> {
        let peer = self.service.get_peer(network_id, jump_peer_id)?;
        if !peer.is_jump {
            return Err(Error::Forbidden(format!(
                "peer '{}' is not a jump peer",
                peer.name
            )));
        }
        let issued = self.tokens.issue(network_id, jump_peer_id, client_ip);
        debug!("Issued captive token for gateway {}", peer.name);
        Ok(issued)
    }

    pub fn authenticate(&self, req: &CaptiveAuthRequest) -> Result<WhitelistEntry> {
        let pending = self
            .tokens
            .take(&req.captive_token)
            .ok_or_else(|| Error::Unauthorized("invalid or expired captive token".into()))?;

        if let Some(bound) = pending.client_ip {
            if bound != req.peer_ip {
                warn!(
                    "Captive token bound to {} presented for {}",
                    bound, req.peer_ip
                );
                return Err(Error::Forbidden("captive token is bound to another client".into()));
            }
        }

        if self.auth_enabled {
            let hash = req
                .session_hash
                .as_deref()
                .ok_or_else(|| Error::Unauthorized("session required".into()))?;
            let user = self
                .sessions
                .resolve(hash)?
                .ok_or_else(|| Error::Unauthorized("invalid or expired session".into()))?;
            if !user.can_access(pending.network_id) {
                return Err(Error::Forbidden(format!(
                    "user '{}' has no access to this network",
                    user.name
                )));
            }
        }

        let entry = self
            .service
            .add_whitelist(pending.network_id, pending.jump_peer_id, req.peer_ip)?;
        info!(
            "Captive client {} admitted through gateway {}",
            req.peer_ip, pending.jump_peer_id
        );
        Ok(entry)
    }
}
