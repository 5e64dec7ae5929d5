//! Live configuration distribution
//!
//! Connected agents are tracked in a [`ConnectionRegistry`] keyed by
//! (network, peer). Each connection owns a `watch` channel holding the latest
//! compiled push; pushes carry a generation number and an older generation
//! never replaces a newer one, so an agent always converges on the most
//! recent state even when compilations finish out of order.
//!
//! The registry lock only guards map access. Snapshot loading, compilation
//! and the socket write all happen outside it.

use crate::meshnet::service::ChangeNotifier;
use netmesh_common::compiler::{compile, CompileOptions, NetworkSnapshot, PeerConfig};
use netmesh_common::{Database, Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry key of one agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub network_id: Uuid,
    pub peer_id: Uuid,
}

impl PeerKey {
    pub fn new(network_id: Uuid, peer_id: Uuid) -> Self {
        Self {
            network_id,
            peer_id,
        }
    }
}

/// Server to agent message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Config(PeerConfig),
}

/// A serialized message tagged with the generation it was compiled for
#[derive(Debug, Clone)]
pub struct AgentPush {
    pub generation: u64,
    pub payload: Arc<str>,
}

type PushSender = watch::Sender<Option<AgentPush>>;

struct Slot {
    conn_id: Uuid,
    tx: Arc<PushSender>,
    cancel: CancellationToken,
}

/// Handed to the connection task on registration
pub struct Registration {
    pub conn_id: Uuid,
    pub updates: watch::Receiver<Option<AgentPush>>,
    /// Cancelled when the connection is replaced or its peer removed
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The slot already holds the same or a newer generation
    Superseded,
    Absent,
    /// Nobody is reading the slot any more
    Closed { conn_id: Uuid },
}

// ============================================================================
// Registry
// ============================================================================

/// Connected agents, grouped by network
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: RwLock<HashMap<Uuid, HashMap<Uuid, Slot>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Any previous connection for the key is
    /// cancelled and replaced.
    pub async fn register(&self, key: PeerKey) -> Registration {
        let (tx, updates) = watch::channel(None);
        let cancel = CancellationToken::new();
        let conn_id = Uuid::new_v4();

        let previous = {
            let mut slots = self.slots.write().await;
            slots.entry(key.network_id).or_default().insert(
                key.peer_id,
                Slot {
                    conn_id,
                    tx: Arc::new(tx),
                    cancel: cancel.clone(),
                },
            )
        };

        if let Some(previous) = previous {
            info!("Replacing agent connection for peer {}", key.peer_id);
            previous.cancel.cancel();
        }

        Registration {
            conn_id,
            updates,
            cancel,
        }
    }

    /// Remove the connection if it is still the registered one for the key.
    /// Networks left without connections are pruned.
    pub async fn unregister(&self, key: PeerKey, conn_id: Uuid) -> bool {
        let mut slots = self.slots.write().await;
        let Some(peers) = slots.get_mut(&key.network_id) else {
            return false;
        };

        let removed = match peers.get(&key.peer_id) {
            Some(slot) if slot.conn_id == conn_id => {
                if let Some(slot) = peers.remove(&key.peer_id) {
                    slot.cancel.cancel();
                }
                true
            }
            _ => false,
        };

        if peers.is_empty() {
            slots.remove(&key.network_id);
        }
        removed
    }

    /// Drop whatever connection the peer has
    pub async fn remove_peer(&self, key: PeerKey) -> bool {
        let mut slots = self.slots.write().await;
        let Some(peers) = slots.get_mut(&key.network_id) else {
            return false;
        };
        let removed = peers.remove(&key.peer_id);
        if peers.is_empty() {
            slots.remove(&key.network_id);
        }
        match removed {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop every connection of a network
    pub async fn remove_network(&self, network_id: Uuid) -> usize {
        let removed = self.slots.write().await.remove(&network_id);
        match removed {
            Some(peers) => {
                for slot in peers.values() {
                    slot.cancel.cancel();
                }
                peers.len()
            }
            None => 0,
        }
    }

    /// Keys currently registered for a network
    pub async fn snapshot(&self, network_id: Uuid) -> Vec<PeerKey> {
        let slots = self.slots.read().await;
        let mut keys: Vec<PeerKey> = slots
            .get(&network_id)
            .map(|peers| {
                peers
                    .keys()
                    .map(|peer_id| PeerKey::new(network_id, *peer_id))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort_by_key(|k| k.peer_id);
        keys
    }

    /// Offer a push to the key's connection, if there is one
    pub async fn send_if_present(&self, key: PeerKey, push: AgentPush) -> SendOutcome {
        let slot = {
            let slots = self.slots.read().await;
            slots
                .get(&key.network_id)
                .and_then(|peers| peers.get(&key.peer_id))
                .map(|slot| (slot.conn_id, slot.tx.clone()))
        };

        let Some((conn_id, tx)) = slot else {
            return SendOutcome::Absent;
        };
        if tx.receiver_count() == 0 {
            return SendOutcome::Closed { conn_id };
        }

        let replaced = tx.send_if_modified(|current| {
            let stale = current
                .as_ref()
                .is_some_and(|existing| existing.generation >= push.generation);
            if !stale {
                *current = Some(push);
            }
            !stale
        });

        if replaced {
            SendOutcome::Delivered
        } else {
            SendOutcome::Superseded
        }
    }

    pub async fn is_connected(&self, key: PeerKey) -> bool {
        self.slots
            .read()
            .await
            .get(&key.network_id)
            .is_some_and(|peers| peers.contains_key(&key.peer_id))
    }

    pub async fn connection_count(&self) -> usize {
        self.slots.read().await.values().map(|peers| peers.len()).sum()
    }
}

// ============================================================================
// Manager
// ============================================================================

struct Inner {
    db: Database,
    options: CompileOptions,
    registry: ConnectionRegistry,
    generation: AtomicU64,
}

/// Recompiles and pushes configuration to connected agents
#[derive(Clone)]
pub struct DistributionManager {
    inner: Arc<Inner>,
}

impl DistributionManager {
    pub fn new(db: Database, options: CompileOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                options,
                registry: ConnectionRegistry::new(),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Register an agent connection and push its current configuration
    pub async fn register(&self, key: PeerKey) -> Registration {
        let registration = self.inner.registry.register(key).await;
        info!(
            "Agent registered: peer {} in network {}",
            key.peer_id, key.network_id
        );
        self.push_peer(key).await;
        registration
    }

    pub async fn unregister(&self, key: PeerKey, conn_id: Uuid) {
        if self.inner.registry.unregister(key, conn_id).await {
            info!("Agent unregistered: peer {}", key.peer_id);
        }
    }

    /// Push fresh configuration to every connected agent of a network.
    /// Returns the number of agents that received a new state.
    pub async fn push_network(&self, network_id: Uuid) -> usize {
        let keys = self.inner.registry.snapshot(network_id).await;
        if keys.is_empty() {
            return 0;
        }

        // Taken before the snapshot is read so later mutations always win
        let generation = self.next_generation();
        let snapshot = match self.load_snapshot(network_id).await {
            Ok(snapshot) => snapshot,
            Err(Error::NotFound { .. }) => {
                self.inner.registry.remove_network(network_id).await;
                return 0;
            }
            Err(e) => {
                warn!("Failed to load network {} for distribution: {}", network_id, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for key in keys {
            if self.deliver(key, generation, &snapshot).await {
                delivered += 1;
            }
        }
        debug!(
            "Pushed generation {} to {} agents of network {}",
            generation, delivered, network_id
        );
        delivered
    }

    /// Push fresh configuration to one agent, if connected
    pub async fn push_peer(&self, key: PeerKey) -> bool {
        if !self.inner.registry.is_connected(key).await {
            return false;
        }
        let generation = self.next_generation();
        match self.load_snapshot(key.network_id).await {
            Ok(snapshot) => self.deliver(key, generation, &snapshot).await,
            Err(e) => {
                warn!("Failed to load network {} for distribution: {}", key.network_id, e);
                false
            }
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst)
    }

    async fn load_snapshot(&self, network_id: Uuid) -> Result<NetworkSnapshot> {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || db.load_snapshot(network_id))
            .await
            .map_err(|e| Error::Internal(format!("snapshot task failed: {}", e)))?
    }

    async fn deliver(&self, key: PeerKey, generation: u64, snapshot: &NetworkSnapshot) -> bool {
        let payload = match compile(key.peer_id, snapshot, &self.inner.options)
            .and_then(|config| Ok(serde_json::to_string(&ServerMessage::Config(config))?))
        {
            Ok(payload) => payload,
            Err(Error::NotFound { .. }) => {
                // Peer deleted since it connected
                self.inner.registry.remove_peer(key).await;
                return false;
            }
            Err(e) => {
                warn!("Failed to compile configuration for peer {}: {}", key.peer_id, e);
                return false;
            }
        };

        let push = AgentPush {
            generation,
            payload: Arc::from(payload),
        };
        match self.inner.registry.send_if_present(key, push).await {
            SendOutcome::Delivered => true,
            SendOutcome::Superseded | SendOutcome::Absent => false,
            SendOutcome::Closed { conn_id } => {
                warn!("Agent connection for peer {} is closed, unregistering", key.peer_id);
                self.inner.registry.unregister(key, conn_id).await;
                false
            }
        }
    }

    fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(DistributionManager) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task(self.clone()));
            }
            Err(_) => warn!("No async runtime, dropping distribution event"),
        }
    }
}

impl ChangeNotifier for DistributionManager {
    fn network_changed(&self, network_id: Uuid) {
        self.spawn(move |this| async move {
            this.push_network(network_id).await;
        });
    }

    fn peer_changed(&self, network_id: Uuid, peer_id: Uuid) {
        self.spawn(move |this| async move {
            this.push_peer(PeerKey::new(network_id, peer_id)).await;
        });
    }

    fn peer_removed(&self, network_id: Uuid, peer_id: Uuid) {
        self.spawn(move |this| async move {
            this.registry().remove_peer(PeerKey::new(network_id, peer_id)).await;
        });
    }

    fn network_removed(&self, network_id: Uuid) {
        self.spawn(move |this| async move {
            let closed = this.registry().remove_network(network_id).await;
            if closed > 0 {
                info!("Closed {} agent connections of deleted network {}", closed, network_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshnet::service::{CreateNetwork, CreatePeer, NetworkService, ServiceOptions};
    use std::time::Duration;

    fn push(generation: u64, body: &str) -> AgentPush {
        AgentPush {
            generation,
            payload: Arc::from(body),
        }
    }

    #[tokio::test]
    async fn test_register_replaces_previous_connection() {
        let registry = ConnectionRegistry::new();
        let key = PeerKey::new(Uuid::new_v4(), Uuid::new_v4());

        let first = registry.register(key).await;
        let second = registry.register(key).await;
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(registry.connection_count().await, 1);

        // A late unregister from the replaced connection is ignored
        assert!(!registry.unregister(key, first.conn_id).await);
        assert!(registry.is_connected(key).await);

        assert!(registry.unregister(key, second.conn_id).await);
        assert!(registry.snapshot(key.network_id).await.is_empty());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_keeps_newest_generation() {
        let registry = ConnectionRegistry::new();
        let key = PeerKey::new(Uuid::new_v4(), Uuid::new_v4());
        let reg = registry.register(key).await;

        assert_eq!(registry.send_if_present(key, push(5, "five")).await, SendOutcome::Delivered);
        assert_eq!(registry.send_if_present(key, push(3, "three")).await, SendOutcome::Superseded);
        assert_eq!(
            reg.updates.borrow().as_ref().map(|p| p.payload.to_string()),
            Some("five".to_string())
        );

        let other = PeerKey::new(key.network_id, Uuid::new_v4());
        assert_eq!(registry.send_if_present(other, push(6, "x")).await, SendOutcome::Absent);
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_is_closed() {
        let registry = ConnectionRegistry::new();
        let key = PeerKey::new(Uuid::new_v4(), Uuid::new_v4());
        let reg = registry.register(key).await;
        let conn_id = reg.conn_id;
        drop(reg);

        assert_eq!(
            registry.send_if_present(key, push(1, "x")).await,
            SendOutcome::Closed { conn_id }
        );
    }

    #[tokio::test]
    async fn test_remove_network_cancels_connections() {
        let registry = ConnectionRegistry::new();
        let net = Uuid::new_v4();
        let a = registry.register(PeerKey::new(net, Uuid::new_v4())).await;
        let b = registry.register(PeerKey::new(net, Uuid::new_v4())).await;

        assert_eq!(registry.snapshot(net).await.len(), 2);
        assert_eq!(registry.remove_network(net).await, 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_manager_pushes_on_register_and_change() {
        let db = Database::open_memory().unwrap();
        let manager = DistributionManager::new(db.clone(), CompileOptions::default());
        let svc = NetworkService::new(db, ServiceOptions::default(), Arc::new(manager.clone()));

        let net = svc
            .create_network(CreateNetwork {
                name: "corp".into(),
                cidr: "10.0.0.0/24".into(),
                domain: None,
            })
            .unwrap();
        let laptop = svc
            .create_peer(net.id, CreatePeer { name: "laptop".into(), ..Default::default() })
            .unwrap()
            .peer;

        let key = PeerKey::new(net.id, laptop.id);
        let mut reg = manager.register(key).await;
        let initial = reg.updates.borrow_and_update().clone().unwrap();
        let message: serde_json::Value = serde_json::from_str(&initial.payload).unwrap();
        assert_eq!(message["type"], "config");
        assert_eq!(message["config"]["interface"]["name"], "laptop");
        assert!(message.get("whitelist").is_none());

        svc.create_peer(net.id, CreatePeer { name: "desktop".into(), ..Default::default() })
            .unwrap();
        // Pushes already in flight may land first; wait for one that has the new peer
        let message = loop {
            tokio::time::timeout(Duration::from_secs(5), reg.updates.changed())
                .await
                .unwrap()
                .unwrap();
            let update = reg.updates.borrow_and_update().clone().unwrap();
            assert!(update.generation > initial.generation);
            let message: serde_json::Value = serde_json::from_str(&update.payload).unwrap();
            if message["config"]["peers"].as_array().is_some_and(|p| !p.is_empty()) {
                break message;
            }
        };
        assert_eq!(message["config"]["peers"][0]["name"], "desktop");

        svc.delete_peer(net.id, laptop.id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reg.cancel.cancelled())
            .await
            .unwrap();
        assert!(!manager.registry().is_connected(key).await);
    }
}
