//! User sessions for captive-portal authentication
//!
//! Session tokens are opaque; only their SHA-256 hash is persisted.

use netmesh_common::crypto::{generate_token, hash_token};
use netmesh_common::{now_epoch_secs, Database, Error, Result, Session, User};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

/// Resolves session credentials to users
pub trait SessionStore: Send + Sync {
    /// Look up the user behind a hashed session token. Expired sessions
    /// resolve to `None`.
    fn resolve(&self, token_hash: &str) -> Result<Option<User>>;
}

/// Session store backed by the control database
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
    ttl_secs: i64,
}

impl SqliteSessionStore {
    pub fn new(db: Database, ttl_secs: u64) -> Self {
        Self {
            db,
            ttl_secs: ttl_secs.min(i64::MAX as u64) as i64,
        }
    }

    pub fn create_user(
        &self,
        name: &str,
        is_admin: bool,
        authorized_networks: BTreeSet<Uuid>,
    ) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("user name cannot be empty"));
        }

        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_admin,
            authorized_networks,
            created_at: now_epoch_secs(),
        };
        self.db.transaction(|s| s.put_user(&user))?;
        info!("Created user {} ({})", user.name, user.id);
        Ok(user)
    }

    pub fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.db
            .read(|s| s.get_user(user_id))?
            .ok_or_else(|| Error::not_found("user", user_id))
    }

    /// Open a session and return the raw token
    pub fn create_session(&self, user_id: Uuid) -> Result<String> {
        let token = generate_token();
        let now = now_epoch_secs();
        let session = Session {
            user_id,
            token_hash: hash_token(&token),
            expires_at: now.saturating_add(self.ttl_secs),
            created_at: now,
        };

        self.db.transaction(|s| {
            if s.get_user(user_id)?.is_none() {
                return Err(Error::not_found("user", user_id));
            }
            s.put_session(&session)
        })?;
        debug!("Opened session for user {}", user_id);
        Ok(token)
    }

    pub fn revoke(&self, token: &str) -> Result<()> {
        let hash = hash_token(token);
        self.db.transaction(|s| s.delete_session(&hash))
    }

    /// Drop expired sessions
    pub fn purge_expired(&self) -> Result<usize> {
        self.db.transaction(|s| s.cleanup_expired_sessions())
    }
}

impl SessionStore for SqliteSessionStore {
    fn resolve(&self, token_hash: &str) -> Result<Option<User>> {
        self.db.transaction(|s| {
            let Some(session) = s.get_session(token_hash)? else {
                return Ok(None);
            };
            if session.expires_at <= now_epoch_secs() {
                s.delete_session(token_hash)?;
                return Ok(None);
            }
            s.get_user(session.user_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let store = SqliteSessionStore::new(Database::open_memory().unwrap(), 3600);
        let net = Uuid::new_v4();
        let user = store
            .create_user("alice", false, BTreeSet::from([net]))
            .unwrap();

        let token = store.create_session(user.id).unwrap();
        let resolved = store.resolve(&hash_token(&token)).unwrap().unwrap();
        assert_eq!(resolved.id, user.id);
        assert!(resolved.can_access(net));
        assert!(!resolved.can_access(Uuid::new_v4()));

        // Raw token is never a valid key
        assert!(store.resolve(&token).unwrap().is_none());

        store.revoke(&token).unwrap();
        assert!(store.resolve(&hash_token(&token)).unwrap().is_none());
    }

    #[test]
    fn test_expired_session_is_rejected() {
        let store = SqliteSessionStore::new(Database::open_memory().unwrap(), 0);
        let user = store.create_user("bob", true, BTreeSet::new()).unwrap();
        let token = store.create_session(user.id).unwrap();
        assert!(store.resolve(&hash_token(&token)).unwrap().is_none());
    }

    #[test]
    fn test_session_requires_user() {
        let store = SqliteSessionStore::new(Database::open_memory().unwrap(), 60);
        assert!(matches!(
            store.create_session(Uuid::new_v4()),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.create_user("  ", false, BTreeSet::new()),
            Err(Error::Validation(_))
        ));
    }
}
