//! Heartbeat-driven incident detection
//!
//! Heartbeats are parsed on the agent's read loop and handed to
//! [`IncidentDispatcher::submit`], which only does a `try_send` into a
//! bounded per-network queue. One task per network drains the queue into an
//! [`IncidentDetector`]. A full queue drops the event.

use async_trait::async_trait;
use dashmap::DashMap;
use netmesh_common::{
    now_epoch_secs, Database, IncidentKind, Peer, Result, SecurityConfig, SecurityIncident,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Agent heartbeat payload
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub hostname: String,
    #[serde(default)]
    pub peer_endpoints: Vec<ObservedEndpoint>,
}

/// One remote peer as seen by the reporting agent
#[derive(Debug, Clone, Deserialize)]
pub struct ObservedEndpoint {
    #[serde(default)]
    pub peer_id: Option<Uuid>,
    #[serde(default)]
    pub public_key: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub last_handshake: Option<i64>,
}

/// A heartbeat queued for detection
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub network_id: Uuid,
    pub reporter_id: Uuid,
    pub received_at: i64,
    pub heartbeat: Heartbeat,
}

/// Turns heartbeats into incidents
#[async_trait]
pub trait IncidentDetector: Send + Sync {
    async fn inspect(&self, event: &HeartbeatEvent) -> Result<Vec<SecurityIncident>>;

    /// Drop state kept for a deleted peer
    fn forget_peer(&self, _peer_id: Uuid) {}

    /// Drop state kept for every peer of a deleted network
    fn forget_network(&self, _network_id: Uuid) {}

    /// Drop state not refreshed since `cutoff`. Returns the number of entries removed.
    fn prune(&self, _cutoff: i64) -> usize {
        0
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Fans heartbeats out to per-network detection tasks
#[derive(Clone)]
pub struct IncidentDispatcher {
    queues: Arc<DashMap<Uuid, mpsc::Sender<HeartbeatEvent>>>,
    detector: Arc<dyn IncidentDetector>,
    db: Database,
    capacity: usize,
}

impl IncidentDispatcher {
    pub fn new(db: Database, detector: Arc<dyn IncidentDetector>, capacity: usize) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            detector,
            db,
            capacity: capacity.max(1),
        }
    }

    /// Queue a heartbeat without waiting. Returns false if it was dropped.
    pub fn submit(&self, event: HeartbeatEvent) -> bool {
        let network_id = event.network_id;
        let sender = self
            .queues
            .entry(network_id)
            .or_insert_with(|| self.spawn_worker(network_id))
            .clone();

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Incident queue for network {} is full, dropping heartbeat", network_id);
                false
            }
            Err(TrySendError::Closed(event)) => {
                // Worker went away; start a fresh one and retry once
                self.queues.remove(&network_id);
                let sender = self.spawn_worker(network_id);
                let accepted = sender.try_send(event).is_ok();
                self.queues.insert(network_id, sender);
                accepted
            }
        }
    }

    /// Stop the network's worker once its queue drains
    pub fn remove_network(&self, network_id: Uuid) {
        self.queues.remove(&network_id);
        self.detector.forget_network(network_id);
    }

    pub fn remove_peer(&self, peer_id: Uuid) {
        self.detector.forget_peer(peer_id);
    }

    /// Drop detector state older than a day
    pub fn prune(&self, now: i64) -> usize {
        self.detector.prune(now - DAY_SECS)
    }

    fn spawn_worker(&self, network_id: Uuid) -> mpsc::Sender<HeartbeatEvent> {
        let (tx, mut rx) = mpsc::channel::<HeartbeatEvent>(self.capacity);
        let detector = self.detector.clone();
        let db = self.db.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let incidents = match detector.inspect(&event).await {
                    Ok(incidents) => incidents,
                    Err(e) => {
                        warn!("Incident detection failed for network {}: {}", network_id, e);
                        continue;
                    }
                };
                for incident in incidents {
                    warn!(
                        "Security incident {} for peer {}: {}",
                        incident.kind, incident.peer_id, incident.detail
                    );
                    if let Err(e) = db.transaction(|s| s.put_incident(&incident)) {
                        warn!("Failed to persist incident {}: {}", incident.id, e);
                    }
                }
            }
            debug!("Incident worker for network {} stopped", network_id);
        });

        tx
    }
}

// ============================================================================
// Threshold detector
// ============================================================================

#[derive(Debug, Clone)]
struct EndpointHistory {
    network_id: Uuid,
    endpoint: String,
    last_seen: i64,
    last_change: Option<i64>,
    changes: VecDeque<i64>,
}

/// Flags endpoint churn using the network's [`SecurityConfig`] thresholds
pub struct ThresholdDetector {
    db: Database,
    history: Mutex<HashMap<Uuid, EndpointHistory>>,
}

impl ThresholdDetector {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record one observation and return what it triggers
    fn observe(
        &self,
        config: &SecurityConfig,
        peer_id: Uuid,
        endpoint: &str,
        at: i64,
    ) -> Vec<(IncidentKind, String, Vec<String>)> {
        let mut history = self.history.lock();
        let Some(entry) = history.get_mut(&peer_id) else {
            history.insert(
                peer_id,
                EndpointHistory {
                    network_id: config.network_id,
                    endpoint: endpoint.to_string(),
                    last_seen: at,
                    last_change: None,
                    changes: VecDeque::new(),
                },
            );
            return Vec::new();
        };

        if entry.endpoint == endpoint {
            entry.last_seen = at;
            return Vec::new();
        }

        let previous = std::mem::replace(&mut entry.endpoint, endpoint.to_string());
        let endpoints = vec![previous.clone(), endpoint.to_string()];
        let mut found = Vec::new();

        let idle = at - entry.last_seen;
        if idle < config.session_conflict_threshold_secs as i64 {
            found.push((
                IncidentKind::SessionConflict,
                format!(
                    "seen at {} while {} was active {}s ago",
                    endpoint, previous, idle
                ),
                endpoints.clone(),
            ));
        }

        if let Some(last_change) = entry.last_change {
            let since = at - last_change;
            if since < config.endpoint_change_threshold_secs as i64 {
                found.push((
                    IncidentKind::RapidEndpointChange,
                    format!("endpoint changed again after {}s", since),
                    endpoints.clone(),
                ));
            }
        }

        entry.changes.push_back(at);
        while entry.changes.front().is_some_and(|t| at - *t >= DAY_SECS) {
            entry.changes.pop_front();
        }
        if entry.changes.len() > config.max_endpoint_changes_per_day as usize {
            found.push((
                IncidentKind::ExcessiveEndpointChanges,
                format!("{} endpoint changes in the last 24h", entry.changes.len()),
                endpoints,
            ));
        }

        entry.last_seen = at;
        entry.last_change = Some(at);
        found
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.history.lock().len()
    }
}

#[async_trait]
impl IncidentDetector for ThresholdDetector {
    async fn inspect(&self, event: &HeartbeatEvent) -> Result<Vec<SecurityIncident>> {
        let network_id = event.network_id;
        let (config, peers) = self.db.read(|s| {
            let config = s
                .get_security_config(network_id)?
                .unwrap_or_else(|| SecurityConfig::default_for(network_id));
            Ok((config, s.list::<Peer>(network_id)?))
        })?;
        if !config.enabled {
            return Ok(Vec::new());
        }

        let mut incidents = Vec::new();
        for observed in &event.heartbeat.peer_endpoints {
            let peer = peers.iter().find(|p| {
                Some(p.id) == observed.peer_id
                    || observed.public_key.as_deref() == Some(p.public_key.as_str())
            });
            let Some(peer) = peer else {
                debug!("Heartbeat mentions unknown peer, ignoring");
                continue;
            };
            if peer.id == event.reporter_id {
                continue;
            }

            let at = observed.last_handshake.unwrap_or(event.received_at);
            for (kind, detail, endpoints) in self.observe(&config, peer.id, &observed.endpoint, at) {
                incidents.push(SecurityIncident {
                    id: Uuid::new_v4(),
                    network_id,
                    peer_id: peer.id,
                    kind,
                    detail,
                    endpoints,
                    detected_at: now_epoch_secs(),
                    resolved: false,
                });
            }
        }
        Ok(incidents)
    }

    fn forget_peer(&self, peer_id: Uuid) {
        self.history.lock().remove(&peer_id);
    }

    fn forget_network(&self, network_id: Uuid) {
        self.history.lock().retain(|_, h| h.network_id != network_id);
    }

    fn prune(&self, cutoff: i64) -> usize {
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|_, h| h.last_seen >= cutoff);
        before - history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> SecurityConfig {
        SecurityConfig {
            network_id: Uuid::new_v4(),
            enabled: true,
            session_conflict_threshold_secs: 300,
            endpoint_change_threshold_secs: 600,
            max_endpoint_changes_per_day: 3,
        }
    }

    fn kinds(found: &[(IncidentKind, String, Vec<String>)]) -> Vec<IncidentKind> {
        found.iter().map(|(k, _, _)| *k).collect()
    }

    #[test]
    fn test_heartbeat_parsing() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{"hostname":"gw","peer_endpoints":[{"public_key":"abc","endpoint":"1.2.3.4:51820"}]}"#,
        )
        .unwrap();
        assert_eq!(hb.peer_endpoints.len(), 1);
        assert!(hb.peer_endpoints[0].peer_id.is_none());

        assert!(serde_json::from_str::<Heartbeat>(r#"{"peer_endpoints":[]}"#).is_err());
        assert!(serde_json::from_str::<Heartbeat>("not json").is_err());
    }

    #[test]
    fn test_stable_endpoint_is_quiet() {
        let detector = ThresholdDetector::new(Database::open_memory().unwrap());
        let cfg = config();
        let peer = Uuid::new_v4();
        assert!(detector.observe(&cfg, peer, "1.1.1.1:1", 0).is_empty());
        assert!(detector.observe(&cfg, peer, "1.1.1.1:1", 10).is_empty());
        // Long gap before moving is a normal roam
        assert!(detector.observe(&cfg, peer, "2.2.2.2:1", 10_000).is_empty());
    }

    #[test]
    fn test_session_conflict_and_rapid_change() {
        let detector = ThresholdDetector::new(Database::open_memory().unwrap());
        let cfg = config();
        let peer = Uuid::new_v4();

        detector.observe(&cfg, peer, "1.1.1.1:1", 0);
        let found = detector.observe(&cfg, peer, "2.2.2.2:1", 60);
        assert_eq!(kinds(&found), vec![IncidentKind::SessionConflict]);
        assert_eq!(found[0].2, vec!["1.1.1.1:1".to_string(), "2.2.2.2:1".to_string()]);

        let found = detector.observe(&cfg, peer, "3.3.3.3:1", 2_000);
        assert_eq!(kinds(&found), Vec::<IncidentKind>::new());

        let found = detector.observe(&cfg, peer, "4.4.4.4:1", 2_400);
        assert!(kinds(&found).contains(&IncidentKind::RapidEndpointChange));
    }

    #[test]
    fn test_excessive_changes_per_day() {
        let detector = ThresholdDetector::new(Database::open_memory().unwrap());
        let cfg = config();
        let peer = Uuid::new_v4();

        detector.observe(&cfg, peer, "ep-0", 0);
        let mut last = Vec::new();
        for i in 1..=4 {
            last = kinds(&detector.observe(&cfg, peer, &format!("ep-{}", i), i * 3_600));
        }
        assert_eq!(last, vec![IncidentKind::ExcessiveEndpointChanges]);

        // Changes older than a day fall out of the window
        let found = detector.observe(&cfg, peer, "ep-late", 4 * 3_600 + DAY_SECS);
        assert!(kinds(&found).is_empty());
    }

    #[test]
    fn test_forget_peer_and_network() {
        let detector = ThresholdDetector::new(Database::open_memory().unwrap());
        let cfg = config();
        let other = SecurityConfig {
            network_id: Uuid::new_v4(),
            ..config()
        };
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        detector.observe(&cfg, a, "1.1.1.1:1", 0);
        detector.observe(&cfg, b, "2.2.2.2:1", 0);
        detector.observe(&other, c, "3.3.3.3:1", 0);
        assert_eq!(detector.tracked(), 3);

        detector.forget_peer(a);
        assert_eq!(detector.tracked(), 2);
        // A re-created peer id starts clean instead of conflicting
        assert!(detector.observe(&cfg, a, "9.9.9.9:1", 10).is_empty());
        detector.forget_peer(a);

        detector.forget_network(cfg.network_id);
        assert_eq!(detector.tracked(), 1);
        assert!(detector.observe(&other, c, "3.3.3.3:1", 5).is_empty());
    }

    #[test]
    fn test_prune_evicts_stale_history() {
        let detector = ThresholdDetector::new(Database::open_memory().unwrap());
        let now = 2 * DAY_SECS;
        let cfg = config();
        let (stale, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        detector.observe(&cfg, stale, "1.1.1.1:1", 0);
        detector.observe(&cfg, fresh, "2.2.2.2:1", now - 60);

        assert_eq!(detector.prune(now - DAY_SECS), 1);
        assert_eq!(detector.tracked(), 1);
        assert!(detector.history.lock().contains_key(&fresh));
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_removals() {
        let db = Database::open_memory().unwrap();
        let detector = Arc::new(ThresholdDetector::new(db.clone()));
        let dispatcher = IncidentDispatcher::new(db, detector.clone(), 4);
        let cfg = config();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        detector.observe(&cfg, a, "1.1.1.1:1", 0);
        detector.observe(&cfg, b, "2.2.2.2:1", now_epoch_secs());

        dispatcher.remove_peer(b);
        assert_eq!(detector.tracked(), 1);
        assert_eq!(dispatcher.prune(now_epoch_secs()), 1);
        assert_eq!(detector.tracked(), 0);

        detector.observe(&cfg, a, "1.1.1.1:1", 0);
        dispatcher.remove_network(cfg.network_id);
        assert_eq!(detector.tracked(), 0);
    }

    struct CountingDetector {
        seen: Mutex<usize>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl IncidentDetector for CountingDetector {
        async fn inspect(&self, _event: &HeartbeatEvent) -> Result<Vec<SecurityIncident>> {
            let _permit = self.gate.acquire().await;
            *self.seen.lock() += 1;
            Ok(Vec::new())
        }
    }

    fn event(network_id: Uuid) -> HeartbeatEvent {
        HeartbeatEvent {
            network_id,
            reporter_id: Uuid::new_v4(),
            received_at: 0,
            heartbeat: Heartbeat {
                hostname: "gw".into(),
                peer_endpoints: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let detector = Arc::new(CountingDetector {
            seen: Mutex::new(0),
            gate: tokio::sync::Semaphore::new(0),
        });
        let dispatcher = IncidentDispatcher::new(Database::open_memory().unwrap(), detector.clone(), 2);
        let net = Uuid::new_v4();

        let accepted = (0..10).filter(|_| dispatcher.submit(event(net))).count();
        // The worker may already hold one event while blocked on the gate
        assert!((2..=3).contains(&accepted), "accepted {}", accepted);

        detector.gate.add_permits(16);
        tokio::time::timeout(Duration::from_secs(5), async {
            while *detector.seen.lock() < accepted {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_persists_incidents() {
        use netmesh_common::{Network, Store};

        let db = Database::open_memory().unwrap();
        let net = Network {
            id: Uuid::new_v4(),
            name: "corp".into(),
            cidr: "10.0.0.0/24".parse().unwrap(),
            domain: "corp.mesh".into(),
            created_at: 0,
            updated_at: 0,
        };
        let roamer = Peer {
            id: Uuid::new_v4(),
            network_id: net.id,
            name: "roamer".into(),
            address: "10.0.0.5".parse().unwrap(),
            public_key: "roamer-key".into(),
            is_jump: false,
            owner_id: None,
            hostname: None,
            endpoint: None,
            last_seen_at: None,
            created_at: 0,
            updated_at: 0,
        };
        db.transaction(|s: &Store<'_>| {
            s.put_network(&net)?;
            s.put(&roamer)
        })
        .unwrap();

        let dispatcher = IncidentDispatcher::new(db.clone(), Arc::new(ThresholdDetector::new(db.clone())), 16);
        for (i, ep) in ["1.1.1.1:1", "2.2.2.2:1"].iter().enumerate() {
            dispatcher.submit(HeartbeatEvent {
                network_id: net.id,
                reporter_id: Uuid::new_v4(),
                received_at: 100 + i as i64,
                heartbeat: Heartbeat {
                    hostname: "gw".into(),
                    peer_endpoints: vec![ObservedEndpoint {
                        peer_id: None,
                        public_key: Some("roamer-key".into()),
                        endpoint: ep.to_string(),
                        last_handshake: None,
                    }],
                },
            });
        }

        let incidents = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let incidents = db.read(|s| s.list_incidents(net.id)).unwrap();
                if !incidents.is_empty() {
                    break incidents;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(incidents[0].kind, IncidentKind::SessionConflict);
        assert_eq!(incidents[0].peer_id, roamer.id);
    }
}
