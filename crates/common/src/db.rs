//! SQLite database for netmesh state persistence
//!
//! Entities are stored as JSON documents in a `spec` column next to the few
//! columns that are queried directly (ids, names, token hashes). All reads
//! and writes go through a [`Store`] handed out by [`Database::read`] or
//! [`Database::transaction`]; the latter commits only if the closure succeeds.

use crate::compiler::NetworkSnapshot;
use crate::types::{
    now_epoch_secs, DnsMapping, Group, Network, Peer, Policy, Route, SecurityConfig,
    SecurityIncident, Session, User, WhitelistEntry,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                spec TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                name TEXT NOT NULL,
                token_hash TEXT UNIQUE,
                spec TEXT NOT NULL,
                UNIQUE(network_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_peers_network ON peers(network_id);

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                UNIQUE(network_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_groups_network ON groups(network_id);

            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                UNIQUE(network_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_policies_network ON policies(network_id);

            CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                UNIQUE(network_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_routes_network ON routes(network_id);

            CREATE TABLE IF NOT EXISTS dns_mappings (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                route_id TEXT NOT NULL,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                UNIQUE(route_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_dns_mappings_network ON dns_mappings(network_id);

            CREATE TABLE IF NOT EXISTS security_configs (
                network_id TEXT PRIMARY KEY,
                spec TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS whitelist (
                network_id TEXT NOT NULL,
                jump_peer_id TEXT NOT NULL,
                ip TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (network_id, jump_peer_id, ip)
            );

            CREATE TABLE IF NOT EXISTS security_incidents (
                id TEXT PRIMARY KEY,
                network_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                spec TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_incidents_network ON security_incidents(network_id);

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                spec TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                spec TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            "#,
        )?;

        Ok(())
    }

    /// Run `f` against the database without a transaction
    pub fn read<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&Store { conn: &conn })
    }

    /// Run `f` inside a transaction. Any error rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&Store { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Point-in-time view of one network for the compiler
    pub fn load_snapshot(&self, network_id: Uuid) -> Result<NetworkSnapshot> {
        self.read(|s| {
            let network = s.require_network(network_id)?;
            Ok(NetworkSnapshot {
                network: Some(network),
                peers: s.list::<Peer>(network_id)?,
                groups: s.list::<Group>(network_id)?,
                policies: s.list::<Policy>(network_id)?,
                routes: s.list::<Route>(network_id)?,
                dns_mappings: s.list_network_dns_mappings(network_id)?,
                whitelist: s.list_whitelist(network_id, None)?,
            })
        })
    }
}

// ============================================================================
// Documents
// ============================================================================

/// A network-scoped entity stored as a JSON document
pub trait Document: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const KIND: &'static str;

    fn id(&self) -> Uuid;
    fn network_id(&self) -> Uuid;
    fn name(&self) -> &str;
}

macro_rules! document {
    ($ty:ty, $table:literal, $kind:literal) => {
        impl Document for $ty {
            const TABLE: &'static str = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> Uuid {
                self.id
            }
            fn network_id(&self) -> Uuid {
                self.network_id
            }
            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

document!(Peer, "peers", "peer");
document!(Group, "groups", "group");
document!(Policy, "policies", "policy");
document!(Route, "routes", "route");

/// Typed access to the tables, bound to a connection or open transaction
pub struct Store<'c> {
    conn: &'c Connection,
}

impl<'c> Store<'c> {
    fn query_doc<T: DeserializeOwned>(&self, sql: &str, params: impl Params) -> Result<Option<T>> {
        let spec: Option<String> = self
            .conn
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        spec.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    fn query_docs<T: DeserializeOwned>(&self, sql: &str, params: impl Params) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn put_network(&self, network: &Network) -> Result<()> {
        self.conn.execute(
            "INSERT INTO networks (id, name, spec) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, spec = excluded.spec",
            params![
                network.id.to_string(),
                network.name,
                serde_json::to_string(network)?
            ],
        )?;
        Ok(())
    }

    pub fn get_network(&self, id: Uuid) -> Result<Option<Network>> {
        self.query_doc("SELECT spec FROM networks WHERE id = ?1", params![id.to_string()])
    }

    pub fn require_network(&self, id: Uuid) -> Result<Network> {
        self.get_network(id)?
            .ok_or_else(|| Error::not_found("network", id))
    }

    pub fn find_network_by_name(&self, name: &str) -> Result<Option<Network>> {
        self.query_doc("SELECT spec FROM networks WHERE name = ?1", params![name])
    }

    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.query_docs("SELECT spec FROM networks ORDER BY name, id", [])
    }

    /// Delete a network and everything it owns
    pub fn delete_network(&self, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        for table in [
            "peers",
            "groups",
            "policies",
            "routes",
            "dns_mappings",
            "security_configs",
            "whitelist",
            "security_incidents",
        ] {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE network_id = ?1", table),
                params![id],
            )?;
        }
        let removed = self
            .conn
            .execute("DELETE FROM networks WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    // ========================================================================
    // Network-scoped documents
    // ========================================================================

    pub fn get<T: Document>(&self, id: Uuid) -> Result<Option<T>> {
        self.query_doc(
            &format!("SELECT spec FROM {} WHERE id = ?1", T::TABLE),
            params![id.to_string()],
        )
    }

    /// Fetch a document that must exist inside `network_id`
    pub fn require<T: Document>(&self, network_id: Uuid, id: Uuid) -> Result<T> {
        match self.get::<T>(id)? {
            Some(doc) if doc.network_id() == network_id => Ok(doc),
            _ => Err(Error::not_found(T::KIND, id)),
        }
    }

    pub fn find_by_name<T: Document>(&self, network_id: Uuid, name: &str) -> Result<Option<T>> {
        self.query_doc(
            &format!(
                "SELECT spec FROM {} WHERE network_id = ?1 AND name = ?2",
                T::TABLE
            ),
            params![network_id.to_string(), name],
        )
    }

    /// Fail with `AlreadyExists` if another document in the network has `name`
    pub fn ensure_unique_name<T: Document>(&self, network_id: Uuid, name: &str, except: Option<Uuid>) -> Result<()> {
        match self.find_by_name::<T>(network_id, name)? {
            Some(existing) if Some(existing.id()) != except => Err(Error::AlreadyExists {
                kind: T::KIND.to_string(),
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn list<T: Document>(&self, network_id: Uuid) -> Result<Vec<T>> {
        self.query_docs(
            &format!(
                "SELECT spec FROM {} WHERE network_id = ?1 ORDER BY name, id",
                T::TABLE
            ),
            params![network_id.to_string()],
        )
    }

    pub fn put<T: Document>(&self, doc: &T) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, network_id, name, spec) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, spec = excluded.spec",
                T::TABLE
            ),
            params![
                doc.id().to_string(),
                doc.network_id().to_string(),
                doc.name(),
                serde_json::to_string(doc)?
            ],
        )?;
        Ok(())
    }

    pub fn delete<T: Document>(&self, id: Uuid) -> Result<bool> {
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", T::TABLE),
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    // ========================================================================
    // Peer enrollment tokens
    // ========================================================================

    pub fn set_peer_token_hash(&self, peer_id: Uuid, token_hash: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE peers SET token_hash = ?1 WHERE id = ?2",
            params![token_hash, peer_id.to_string()],
        )?;
        if updated == 0 {
            return Err(Error::not_found("peer", peer_id));
        }
        Ok(())
    }

    pub fn find_peer_by_token_hash(&self, token_hash: &str) -> Result<Option<Peer>> {
        self.query_doc(
            "SELECT spec FROM peers WHERE token_hash = ?1",
            params![token_hash],
        )
    }

    // ========================================================================
    // DNS mappings
    // ========================================================================

    pub fn put_dns_mapping(&self, mapping: &DnsMapping) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dns_mappings (id, network_id, route_id, name, spec) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, spec = excluded.spec",
            params![
                mapping.id.to_string(),
                mapping.network_id.to_string(),
                mapping.route_id.to_string(),
                mapping.name,
                serde_json::to_string(mapping)?
            ],
        )?;
        Ok(())
    }

    pub fn get_dns_mapping(&self, id: Uuid) -> Result<Option<DnsMapping>> {
        self.query_doc(
            "SELECT spec FROM dns_mappings WHERE id = ?1",
            params![id.to_string()],
        )
    }

    pub fn find_dns_mapping_by_name(&self, route_id: Uuid, name: &str) -> Result<Option<DnsMapping>> {
        self.query_doc(
            "SELECT spec FROM dns_mappings WHERE route_id = ?1 AND name = ?2",
            params![route_id.to_string(), name],
        )
    }

    pub fn list_dns_mappings(&self, route_id: Uuid) -> Result<Vec<DnsMapping>> {
        self.query_docs(
            "SELECT spec FROM dns_mappings WHERE route_id = ?1 ORDER BY name, id",
            params![route_id.to_string()],
        )
    }

    pub fn list_network_dns_mappings(&self, network_id: Uuid) -> Result<Vec<DnsMapping>> {
        self.query_docs(
            "SELECT spec FROM dns_mappings WHERE network_id = ?1 ORDER BY route_id, name, id",
            params![network_id.to_string()],
        )
    }

    pub fn delete_dns_mapping(&self, id: Uuid) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM dns_mappings WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_route_dns_mappings(&self, route_id: Uuid) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM dns_mappings WHERE route_id = ?1",
            params![route_id.to_string()],
        )?)
    }

    // ========================================================================
    // Security configuration and incidents
    // ========================================================================

    pub fn get_security_config(&self, network_id: Uuid) -> Result<Option<SecurityConfig>> {
        self.query_doc(
            "SELECT spec FROM security_configs WHERE network_id = ?1",
            params![network_id.to_string()],
        )
    }

    pub fn put_security_config(&self, config: &SecurityConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO security_configs (network_id, spec) VALUES (?1, ?2)
             ON CONFLICT(network_id) DO UPDATE SET spec = excluded.spec",
            params![config.network_id.to_string(), serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    pub fn put_incident(&self, incident: &SecurityIncident) -> Result<()> {
        self.conn.execute(
            "INSERT INTO security_incidents (id, network_id, peer_id, detected_at, spec) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET spec = excluded.spec",
            params![
                incident.id.to_string(),
                incident.network_id.to_string(),
                incident.peer_id.to_string(),
                incident.detected_at,
                serde_json::to_string(incident)?
            ],
        )?;
        Ok(())
    }

    pub fn get_incident(&self, id: Uuid) -> Result<Option<SecurityIncident>> {
        self.query_doc(
            "SELECT spec FROM security_incidents WHERE id = ?1",
            params![id.to_string()],
        )
    }

    pub fn list_incidents(&self, network_id: Uuid) -> Result<Vec<SecurityIncident>> {
        self.query_docs(
            "SELECT spec FROM security_incidents WHERE network_id = ?1 ORDER BY detected_at DESC, id",
            params![network_id.to_string()],
        )
    }

    pub fn delete_peer_incidents(&self, peer_id: Uuid) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM security_incidents WHERE peer_id = ?1",
            params![peer_id.to_string()],
        )?)
    }

    // ========================================================================
    // Captive portal whitelist
    // ========================================================================

    /// Returns false if the entry was already present
    pub fn add_whitelist(&self, entry: &WhitelistEntry) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO whitelist (network_id, jump_peer_id, ip, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.network_id.to_string(),
                entry.jump_peer_id.to_string(),
                entry.ip.to_string(),
                entry.created_at
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_whitelist(&self, network_id: Uuid, jump_peer_id: Uuid, ip: IpAddr) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM whitelist WHERE network_id = ?1 AND jump_peer_id = ?2 AND ip = ?3",
            params![network_id.to_string(), jump_peer_id.to_string(), ip.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_peer_whitelist(&self, jump_peer_id: Uuid) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM whitelist WHERE jump_peer_id = ?1",
            params![jump_peer_id.to_string()],
        )?)
    }

    /// Whitelist entries of a network, optionally limited to one jump peer
    pub fn list_whitelist(&self, network_id: Uuid, jump_peer_id: Option<Uuid>) -> Result<Vec<WhitelistEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT jump_peer_id, ip, created_at FROM whitelist
             WHERE network_id = ?1 AND (?2 IS NULL OR jump_peer_id = ?2)
             ORDER BY jump_peer_id, ip",
        )?;
        let rows = stmt.query_map(
            params![network_id.to_string(), jump_peer_id.map(|id| id.to_string())],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (jump, ip, created_at) = row?;
            entries.push(WhitelistEntry {
                network_id,
                jump_peer_id: Uuid::parse_str(&jump)
                    .map_err(|e| Error::Internal(format!("bad whitelist peer id: {}", e)))?,
                ip: ip
                    .parse()
                    .map_err(|e| Error::Internal(format!("bad whitelist address: {}", e)))?,
                created_at,
            });
        }
        Ok(entries)
    }

    // ========================================================================
    // Users and sessions
    // ========================================================================

    pub fn put_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, spec) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET spec = excluded.spec",
            params![user.id.to_string(), serde_json::to_string(user)?],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.query_doc("SELECT spec FROM users WHERE id = ?1", params![id.to_string()])
    }

    pub fn put_session(&self, session: &Session) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (token_hash, user_id, expires_at, spec) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token_hash) DO UPDATE SET expires_at = excluded.expires_at, spec = excluded.spec",
            params![
                session.token_hash,
                session.user_id.to_string(),
                session.expires_at,
                serde_json::to_string(session)?
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, token_hash: &str) -> Result<Option<Session>> {
        self.query_doc(
            "SELECT spec FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )
    }

    pub fn delete_session(&self, token_hash: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(())
    }

    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![now_epoch_secs()],
        )?)
    }
}
