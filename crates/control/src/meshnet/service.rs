//! Network service
//!
//! The only entry point for mutating networks, peers, groups, policies,
//! routes and DNS mappings. Each operation validates its input, applies the
//! consistency rules from [`netmesh_common::invariants`], persists inside a
//! single sqlite transaction and, once committed, tells the
//! [`ChangeNotifier`] so connected agents get fresh configuration.

use ipnetwork::IpNetwork;
use netmesh_common::cidr::{self, CidrSuggestion};
use netmesh_common::compiler::{compile, CompileOptions, PeerConfig};
use netmesh_common::crypto::{generate_token, hash_token, validate_public_key, WgKeyPair};
use netmesh_common::invariants::{
    check_dns_mapping, check_group_routing, check_group_update, check_policy_order,
    check_priority, check_route_gateway,
};
use netmesh_common::names::{validate_display_name, validate_domain, validate_label};
use netmesh_common::{
    now_epoch_secs, Action, Database, Direction, DnsMapping, Error, Group, Network, Peer, Policy,
    PolicyRule, ReservedGroup, Result, Route, RuleTarget, SecurityConfig, SecurityIncident, Store,
    TargetType, WhitelistEntry, DEFAULT_ROUTE_DOMAIN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Receives committed changes. Implementations must not block.
pub trait ChangeNotifier: Send + Sync {
    /// Something affecting every peer of the network changed
    fn network_changed(&self, network_id: Uuid);

    /// Only this peer's compiled configuration changed
    fn peer_changed(&self, network_id: Uuid, peer_id: Uuid);

    /// The peer is gone; its agent connection should be closed
    fn peer_removed(&self, network_id: Uuid, peer_id: Uuid);

    /// The network is gone
    fn network_removed(&self, network_id: Uuid);
}

/// Notifier that drops every event
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn network_changed(&self, _network_id: Uuid) {}
    fn peer_changed(&self, _network_id: Uuid, _peer_id: Uuid) {}
    fn peer_removed(&self, _network_id: Uuid, _peer_id: Uuid) {}
    fn network_removed(&self, _network_id: Uuid) {}
}

/// Static inputs of the service, taken from the control configuration
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub compile: CompileOptions,
    /// Blocks never handed out by CIDR suggestion
    pub reserved_cidrs: Vec<IpNetwork>,
    /// Also treat every existing network's CIDR as reserved
    pub reserve_existing_networks: bool,
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNetwork {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNetwork {
    pub name: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSecurityConfig {
    pub enabled: bool,
    pub session_conflict_threshold_secs: u64,
    pub endpoint_change_threshold_secs: u64,
    pub max_endpoint_changes_per_day: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePeer {
    pub name: String,
    #[serde(default)]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub is_jump: bool,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePeer {
    pub name: Option<String>,
    pub public_key: Option<String>,
    pub is_jump: Option<bool>,
    pub owner_id: Option<Uuid>,
}

/// A freshly created peer. The token and private key are never stored.
#[derive(Debug, Clone, Serialize)]
pub struct PeerEnrollment {
    pub peer: Peer,
    pub enrollment_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub priority: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGroup {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub direction: Direction,
    pub action: Action,
    pub target_type: TargetType,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePolicy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePolicy {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoute {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub destination_cidr: String,
    pub jump_peer_id: Uuid,
    #[serde(default)]
    pub domain_suffix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRoute {
    pub name: Option<String>,
    pub description: Option<String>,
    pub destination_cidr: Option<String>,
    pub jump_peer_id: Option<Uuid>,
    pub domain_suffix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDnsMapping {
    pub name: String,
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDnsMapping {
    pub name: Option<String>,
    pub ip_address: Option<IpAddr>,
}

/// DNS mapping together with its resolved name
#[derive(Debug, Clone, Serialize)]
pub struct DnsMappingView {
    #[serde(flatten)]
    pub mapping: DnsMapping,
    pub fqdn: String,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_cidr(field: &str, value: &str) -> Result<IpNetwork> {
    value
        .trim()
        .parse::<IpNetwork>()
        .map(cidr::normalize)
        .map_err(|e| Error::validation(format!("invalid {} '{}': {}", field, value, e)))
}

fn peer_label(s: &Store<'_>, id: Uuid) -> String {
    s.get::<Peer>(id)
        .ok()
        .flatten()
        .map(|p| p.name)
        .unwrap_or_else(|| id.to_string())
}

/// Evaluate the circular-routing rule for a prospective group state
fn guard_group(
    s: &Store<'_>,
    group: &Group,
    members: &BTreeSet<Uuid>,
    route_ids: &BTreeSet<Uuid>,
) -> Result<()> {
    let routes = route_ids
        .iter()
        .map(|id| s.require::<Route>(group.network_id, *id))
        .collect::<Result<Vec<_>>>()?;
    check_group_routing(group, members, &routes, |id| peer_label(s, id))
}

fn reserved_group(s: &Store<'_>, network_id: Uuid, kind: ReservedGroup) -> Result<Group> {
    s.list::<Group>(network_id)?
        .into_iter()
        .find(|g| g.reserved == Some(kind))
        .ok_or_else(|| Error::Internal(format!("network {} has no {} group", network_id, kind.name())))
}

fn build_rule(s: &Store<'_>, network_id: Uuid, spec: RuleSpec) -> Result<PolicyRule> {
    let rule = PolicyRule {
        id: Uuid::new_v4(),
        direction: spec.direction,
        action: spec.action,
        target_type: spec.target_type,
        target: spec.target.trim().to_string(),
        description: spec.description,
    };
    match rule.parse_target()? {
        RuleTarget::Cidr(net) => {
            let mut rule = rule;
            rule.target = cidr::normalize(net).to_string();
            Ok(rule)
        }
        RuleTarget::Peer(id) => {
            s.require::<Peer>(network_id, id)?;
            Ok(rule)
        }
        RuleTarget::Group(id) => {
            s.require::<Group>(network_id, id)?;
            Ok(rule)
        }
    }
}

/// Policy with a rule that still targets `target`, if any
fn policy_targeting(s: &Store<'_>, network_id: Uuid, target: RuleTarget) -> Result<Option<Policy>> {
    Ok(s.list::<Policy>(network_id)?
        .into_iter()
        .find(|p| p.rules.iter().any(|r| r.parse_target().ok() == Some(target))))
}

// ============================================================================
// Service
// ============================================================================

/// Invariant-guarded mutation API over the control-plane state
pub struct NetworkService {
    db: Database,
    options: ServiceOptions,
    notifier: Arc<dyn ChangeNotifier>,
}

impl NetworkService {
    pub fn new(db: Database, options: ServiceOptions, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            db,
            options,
            notifier,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn create_network(&self, req: CreateNetwork) -> Result<Network> {
        let name = validate_display_name(&req.name)?;
        let cidr = parse_cidr("cidr", &req.cidr)?;
        let domain = match req.domain.as_deref() {
            Some(d) => validate_domain(d)?,
            None => validate_label(&name.replace(' ', "-"))
                .map(|label| format!("{}.mesh", label))
                .unwrap_or_else(|_| "mesh".to_string()),
        };

        let now = now_epoch_secs();
        let network = Network {
            id: Uuid::new_v4(),
            name,
            cidr,
            domain,
            created_at: now,
            updated_at: now,
        };

        self.db.transaction(|s| {
            if s.find_network_by_name(&network.name)?.is_some() {
                return Err(Error::AlreadyExists {
                    kind: "network".into(),
                    name: network.name.clone(),
                });
            }
            s.put_network(&network)?;
            s.put(&Group::reserved(network.id, ReservedGroup::Default))?;
            s.put(&Group::reserved(network.id, ReservedGroup::Quarantine))?;
            s.put_security_config(&SecurityConfig::default_for(network.id))
        })?;

        info!("Created network '{}' ({}) {}", network.name, network.id, network.cidr);
        Ok(network)
    }

    pub fn get_network(&self, network_id: Uuid) -> Result<Network> {
        self.db.read(|s| s.require_network(network_id))
    }

    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.db.read(|s| s.list_networks())
    }

    pub fn update_network(&self, network_id: Uuid, req: UpdateNetwork) -> Result<Network> {
        let network = self.db.transaction(|s| {
            let mut network = s.require_network(network_id)?;
            if let Some(name) = req.name.as_deref() {
                let name = validate_display_name(name)?;
                if let Some(other) = s.find_network_by_name(&name)? {
                    if other.id != network_id {
                        return Err(Error::AlreadyExists {
                            kind: "network".into(),
                            name,
                        });
                    }
                }
                network.name = name;
            }
            if let Some(domain) = req.domain.as_deref() {
                network.domain = validate_domain(domain)?;
            }
            network.updated_at = now_epoch_secs();
            s.put_network(&network)?;
            Ok(network)
        })?;

        self.notifier.network_changed(network_id);
        Ok(network)
    }

    pub fn delete_network(&self, network_id: Uuid) -> Result<()> {
        let network = self.db.transaction(|s| {
            let network = s.require_network(network_id)?;
            s.delete_network(network_id)?;
            Ok(network)
        })?;

        info!("Deleted network '{}' ({})", network.name, network.id);
        self.notifier.network_removed(network_id);
        Ok(())
    }

    // ========================================================================
    // Security configuration and incidents
    // ========================================================================

    pub fn security_config(&self, network_id: Uuid) -> Result<SecurityConfig> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            Ok(s.get_security_config(network_id)?
                .unwrap_or_else(|| SecurityConfig::default_for(network_id)))
        })
    }

    pub fn update_security_config(&self, network_id: Uuid, req: UpdateSecurityConfig) -> Result<SecurityConfig> {
        if req.session_conflict_threshold_secs == 0
            || req.endpoint_change_threshold_secs == 0
            || req.max_endpoint_changes_per_day == 0
        {
            return Err(Error::validation("security thresholds must be greater than zero"));
        }
        let config = SecurityConfig {
            network_id,
            enabled: req.enabled,
            session_conflict_threshold_secs: req.session_conflict_threshold_secs,
            endpoint_change_threshold_secs: req.endpoint_change_threshold_secs,
            max_endpoint_changes_per_day: req.max_endpoint_changes_per_day,
        };
        self.db.transaction(|s| {
            s.require_network(network_id)?;
            s.put_security_config(&config)
        })?;
        Ok(config)
    }

    pub fn list_incidents(&self, network_id: Uuid) -> Result<Vec<SecurityIncident>> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            s.list_incidents(network_id)
        })
    }

    pub fn resolve_incident(&self, network_id: Uuid, incident_id: Uuid) -> Result<SecurityIncident> {
        self.db.transaction(|s| {
            let mut incident = s
                .get_incident(incident_id)?
                .filter(|i| i.network_id == network_id)
                .ok_or_else(|| Error::not_found("incident", incident_id))?;
            incident.resolved = true;
            s.put_incident(&incident)?;
            Ok(incident)
        })
    }

    // ========================================================================
    // Peers
    // ========================================================================

    pub fn create_peer(&self, network_id: Uuid, req: CreatePeer) -> Result<PeerEnrollment> {
        let name = validate_label(&req.name)?;
        let (public_key, private_key) = match req.public_key {
            Some(key) => {
                validate_public_key(&key)?;
                (key.trim().to_string(), None)
            }
            None => {
                let pair = WgKeyPair::generate();
                (pair.public_key, Some(pair.private_key))
            }
        };
        let token = generate_token();

        let peer = self.db.transaction(|s| {
            let network = s.require_network(network_id)?;
            s.ensure_unique_name::<Peer>(network_id, &name, None)?;

            let used: BTreeSet<IpAddr> = s
                .list::<Peer>(network_id)?
                .into_iter()
                .map(|p| p.address)
                .collect();
            let address = match req.address {
                Some(ip) => {
                    if !cidr::is_assignable_host(&network.cidr, ip) {
                        return Err(Error::validation(format!(
                            "address {} is not a usable host of {}",
                            ip, network.cidr
                        )));
                    }
                    if used.contains(&ip) {
                        return Err(Error::AlreadyExists {
                            kind: "address".into(),
                            name: ip.to_string(),
                        });
                    }
                    ip
                }
                None => cidr::allocate_host(&network.cidr, &used)?,
            };

            let now = now_epoch_secs();
            let peer = Peer {
                id: Uuid::new_v4(),
                network_id,
                name: name.clone(),
                address,
                public_key: public_key.clone(),
                is_jump: req.is_jump,
                owner_id: req.owner_id,
                hostname: None,
                endpoint: None,
                last_seen_at: None,
                created_at: now,
                updated_at: now,
            };
            s.put(&peer)?;
            s.set_peer_token_hash(peer.id, &hash_token(&token))?;

            if !peer.is_jump {
                let mut default = reserved_group(s, network_id, ReservedGroup::Default)?;
                default.peer_ids.insert(peer.id);
                default.touch();
                s.put(&default)?;
            }
            Ok(peer)
        })?;

        info!(
            "Created peer '{}' ({}) at {} in network {}",
            peer.name, peer.id, peer.address, network_id
        );
        self.notifier.network_changed(network_id);
        Ok(PeerEnrollment {
            peer,
            enrollment_token: token,
            private_key,
        })
    }

    pub fn get_peer(&self, network_id: Uuid, peer_id: Uuid) -> Result<Peer> {
        self.db.read(|s| s.require(network_id, peer_id))
    }

    pub fn list_peers(&self, network_id: Uuid) -> Result<Vec<Peer>> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            s.list(network_id)
        })
    }

    pub fn update_peer(&self, network_id: Uuid, peer_id: Uuid, req: UpdatePeer) -> Result<Peer> {
        let peer = self.db.transaction(|s| {
            let mut peer: Peer = s.require(network_id, peer_id)?;
            if let Some(name) = req.name.as_deref() {
                let name = validate_label(name)?;
                s.ensure_unique_name::<Peer>(network_id, &name, Some(peer_id))?;
                peer.name = name;
            }
            if let Some(key) = req.public_key.as_deref() {
                validate_public_key(key)?;
                peer.public_key = key.trim().to_string();
            }
            if let Some(is_jump) = req.is_jump {
                if peer.is_jump && !is_jump {
                    if let Some(route) = s
                        .list::<Route>(network_id)?
                        .into_iter()
                        .find(|r| r.jump_peer_id == peer_id)
                    {
                        return Err(Error::InUse {
                            kind: "peer".into(),
                            name: peer.name.clone(),
                            reason: format!("it is the gateway of route '{}'", route.name),
                        });
                    }
                }
                peer.is_jump = is_jump;
            }
            if let Some(owner) = req.owner_id {
                peer.owner_id = Some(owner);
            }
            peer.updated_at = now_epoch_secs();
            s.put(&peer)?;
            Ok(peer)
        })?;

        self.notifier.network_changed(network_id);
        Ok(peer)
    }

    pub fn delete_peer(&self, network_id: Uuid, peer_id: Uuid) -> Result<()> {
        let peer = self.db.transaction(|s| {
            let peer: Peer = s.require(network_id, peer_id)?;
            if let Some(route) = s
                .list::<Route>(network_id)?
                .into_iter()
                .find(|r| r.jump_peer_id == peer_id)
            {
                return Err(Error::InUse {
                    kind: "peer".into(),
                    name: peer.name.clone(),
                    reason: format!("it is the gateway of route '{}'", route.name),
                });
            }
            if let Some(policy) = policy_targeting(s, network_id, RuleTarget::Peer(peer_id))? {
                return Err(Error::InUse {
                    kind: "peer".into(),
                    name: peer.name.clone(),
                    reason: format!("it is a rule target of policy '{}'", policy.name),
                });
            }

            for mut group in s.list::<Group>(network_id)? {
                if group.peer_ids.remove(&peer_id) {
                    group.touch();
                    s.put(&group)?;
                }
            }
            s.delete_peer_whitelist(peer_id)?;
            s.delete_peer_incidents(peer_id)?;
            s.delete::<Peer>(peer_id)?;
            Ok(peer)
        })?;

        info!("Deleted peer '{}' ({})", peer.name, peer.id);
        self.notifier.peer_removed(network_id, peer_id);
        self.notifier.network_changed(network_id);
        Ok(())
    }

    /// Issue a new enrollment token, invalidating the previous one
    pub fn rotate_peer_token(&self, network_id: Uuid, peer_id: Uuid) -> Result<String> {
        let token = generate_token();
        self.db.transaction(|s| {
            s.require::<Peer>(network_id, peer_id)?;
            s.set_peer_token_hash(peer_id, &hash_token(&token))
        })?;
        // The old token's connection must not outlive it
        self.notifier.peer_removed(network_id, peer_id);
        Ok(token)
    }

    /// Resolve an agent's bearer enrollment token
    pub fn authenticate_agent(&self, token: &str) -> Result<Peer> {
        self.db
            .read(|s| s.find_peer_by_token_hash(&hash_token(token)))?
            .ok_or_else(|| Error::Unauthorized("unknown enrollment token".into()))
    }

    /// Record agent liveness. Returns true if the endpoint changed, which
    /// affects the topology of every other peer.
    pub fn touch_peer(
        &self,
        network_id: Uuid,
        peer_id: Uuid,
        hostname: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<bool> {
        let changed = self.db.transaction(|s| {
            let mut peer: Peer = s.require(network_id, peer_id)?;
            if let Some(hostname) = hostname {
                peer.hostname = Some(hostname.to_string());
            }
            let changed = match endpoint {
                Some(ep) if peer.endpoint.as_deref() != Some(ep) => {
                    peer.endpoint = Some(ep.to_string());
                    true
                }
                _ => false,
            };
            peer.last_seen_at = Some(now_epoch_secs());
            s.put(&peer)?;
            Ok(changed)
        })?;

        if changed {
            debug!("Peer {} endpoint changed", peer_id);
            self.notifier.network_changed(network_id);
        }
        Ok(changed)
    }

    /// Compiled configuration for a peer, as it would be pushed right now
    pub fn compile_peer(&self, network_id: Uuid, peer_id: Uuid) -> Result<PeerConfig> {
        let snapshot = self.db.load_snapshot(network_id)?;
        compile(peer_id, &snapshot, &self.options.compile)
    }

    // ========================================================================
    // Captive portal whitelist
    // ========================================================================

    pub fn add_whitelist(&self, network_id: Uuid, jump_peer_id: Uuid, ip: IpAddr) -> Result<WhitelistEntry> {
        let entry = WhitelistEntry {
            network_id,
            jump_peer_id,
            ip,
            created_at: now_epoch_secs(),
        };
        self.db.transaction(|s| {
            let peer: Peer = s.require(network_id, jump_peer_id)?;
            if !peer.is_jump {
                return Err(Error::validation(format!(
                    "peer '{}' is not a jump peer",
                    peer.name
                )));
            }
            s.add_whitelist(&entry)
        })?;

        info!("Whitelisted {} on jump peer {}", ip, jump_peer_id);
        self.notifier.peer_changed(network_id, jump_peer_id);
        Ok(entry)
    }

    pub fn list_whitelist(&self, network_id: Uuid, jump_peer_id: Uuid) -> Result<Vec<WhitelistEntry>> {
        self.db.read(|s| {
            s.require::<Peer>(network_id, jump_peer_id)?;
            s.list_whitelist(network_id, Some(jump_peer_id))
        })
    }

    pub fn remove_whitelist(&self, network_id: Uuid, jump_peer_id: Uuid, ip: IpAddr) -> Result<()> {
        self.db.transaction(|s| {
            s.require::<Peer>(network_id, jump_peer_id)?;
            if s.remove_whitelist(network_id, jump_peer_id, ip)? {
                Ok(())
            } else {
                Err(Error::not_found("whitelist entry", ip))
            }
        })?;

        self.notifier.peer_changed(network_id, jump_peer_id);
        Ok(())
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub fn create_group(&self, network_id: Uuid, req: CreateGroup) -> Result<Group> {
        let name = validate_display_name(&req.name)?;
        check_priority(req.priority)?;

        let group = Group::new(network_id, &name, &req.description, req.priority);
        self.db.transaction(|s| {
            s.require_network(network_id)?;
            s.ensure_unique_name::<Group>(network_id, &group.name, None)?;
            s.put(&group)
        })?;

        debug!("Created group '{}' ({})", group.name, group.id);
        Ok(group)
    }

    pub fn get_group(&self, network_id: Uuid, group_id: Uuid) -> Result<Group> {
        self.db.read(|s| s.require(network_id, group_id))
    }

    pub fn list_groups(&self, network_id: Uuid) -> Result<Vec<Group>> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            let mut groups: Vec<Group> = s.list(network_id)?;
            groups.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
            Ok(groups)
        })
    }

    pub fn update_group(&self, network_id: Uuid, group_id: Uuid, req: UpdateGroup) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            let name = req.name.as_deref().map(validate_display_name).transpose()?;
            check_group_update(&group, name.as_deref(), req.priority)?;

            if let Some(name) = name {
                s.ensure_unique_name::<Group>(network_id, &name, Some(group_id))?;
                group.name = name;
            }
            if let Some(priority) = req.priority {
                group.priority = priority;
            }
            if let Some(description) = req.description {
                group.description = description;
            }
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn delete_group(&self, network_id: Uuid, group_id: Uuid) -> Result<()> {
        self.db.transaction(|s| {
            let group: Group = s.require(network_id, group_id)?;
            if group.reserved.is_some() {
                return Err(Error::immutable(format!("group '{}'", group.name), "existence"));
            }
            if let Some(policy) = policy_targeting(s, network_id, RuleTarget::Group(group_id))? {
                return Err(Error::InUse {
                    kind: "group".into(),
                    name: group.name.clone(),
                    reason: format!("it is a rule target of policy '{}'", policy.name),
                });
            }
            s.delete::<Group>(group_id)?;
            Ok(())
        })?;

        self.notifier.network_changed(network_id);
        Ok(())
    }

    pub fn add_peer_to_group(&self, network_id: Uuid, group_id: Uuid, peer_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            s.require::<Peer>(network_id, peer_id)?;

            let mut members = group.peer_ids.clone();
            members.insert(peer_id);
            guard_group(s, &group, &members, &group.route_ids)?;

            group.peer_ids = members;
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn remove_peer_from_group(&self, network_id: Uuid, group_id: Uuid, peer_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            if !group.peer_ids.remove(&peer_id) {
                return Err(Error::not_found("group member", peer_id));
            }
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    /// Append a policy to the group's evaluation order
    pub fn attach_policy(&self, network_id: Uuid, group_id: Uuid, policy_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            s.require::<Policy>(network_id, policy_id)?;
            if !group.policy_ids.contains(&policy_id) {
                group.policy_ids.push(policy_id);
                group.touch();
                s.put(&group)?;
            }
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn detach_policy(&self, network_id: Uuid, group_id: Uuid, policy_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            let before = group.policy_ids.len();
            group.policy_ids.retain(|id| *id != policy_id);
            if group.policy_ids.len() == before {
                return Err(Error::not_found("attached policy", policy_id));
            }
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn reorder_policies(&self, network_id: Uuid, group_id: Uuid, policy_ids: Vec<Uuid>) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            check_policy_order(&group.policy_ids, &policy_ids)?;
            group.policy_ids = policy_ids;
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn attach_route(&self, network_id: Uuid, group_id: Uuid, route_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            s.require::<Route>(network_id, route_id)?;

            let mut routes = group.route_ids.clone();
            routes.insert(route_id);
            guard_group(s, &group, &group.peer_ids, &routes)?;

            group.route_ids = routes;
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    pub fn detach_route(&self, network_id: Uuid, group_id: Uuid, route_id: Uuid) -> Result<Group> {
        let group = self.db.transaction(|s| {
            let mut group: Group = s.require(network_id, group_id)?;
            if !group.route_ids.remove(&route_id) {
                return Err(Error::not_found("attached route", route_id));
            }
            group.touch();
            s.put(&group)?;
            Ok(group)
        })?;

        self.notifier.network_changed(network_id);
        Ok(group)
    }

    // ========================================================================
    // Policies
    // ========================================================================

    pub fn create_policy(&self, network_id: Uuid, req: CreatePolicy) -> Result<Policy> {
        let name = validate_display_name(&req.name)?;

        let policy = self.db.transaction(|s| {
            s.require_network(network_id)?;
            s.ensure_unique_name::<Policy>(network_id, &name, None)?;
            let rules = req
                .rules
                .into_iter()
                .map(|spec| build_rule(s, network_id, spec))
                .collect::<Result<Vec<_>>>()?;

            let now = now_epoch_secs();
            let policy = Policy {
                id: Uuid::new_v4(),
                network_id,
                name,
                description: req.description,
                rules,
                created_at: now,
                updated_at: now,
            };
            s.put(&policy)?;
            Ok(policy)
        })?;

        debug!("Created policy '{}' with {} rules", policy.name, policy.rules.len());
        Ok(policy)
    }

    pub fn get_policy(&self, network_id: Uuid, policy_id: Uuid) -> Result<Policy> {
        self.db.read(|s| s.require(network_id, policy_id))
    }

    pub fn list_policies(&self, network_id: Uuid) -> Result<Vec<Policy>> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            s.list(network_id)
        })
    }

    pub fn update_policy(&self, network_id: Uuid, policy_id: Uuid, req: UpdatePolicy) -> Result<Policy> {
        let policy = self.db.transaction(|s| {
            let mut policy: Policy = s.require(network_id, policy_id)?;
            if let Some(name) = req.name.as_deref() {
                let name = validate_display_name(name)?;
                s.ensure_unique_name::<Policy>(network_id, &name, Some(policy_id))?;
                policy.name = name;
            }
            if let Some(description) = req.description {
                policy.description = description;
            }
            policy.updated_at = now_epoch_secs();
            s.put(&policy)?;
            Ok(policy)
        })?;

        self.notifier.network_changed(network_id);
        Ok(policy)
    }

    pub fn delete_policy(&self, network_id: Uuid, policy_id: Uuid) -> Result<()> {
        self.db.transaction(|s| {
            s.require::<Policy>(network_id, policy_id)?;
            for mut group in s.list::<Group>(network_id)? {
                if group.policy_ids.contains(&policy_id) {
                    group.policy_ids.retain(|id| *id != policy_id);
                    group.touch();
                    s.put(&group)?;
                }
            }
            s.delete::<Policy>(policy_id)?;
            Ok(())
        })?;

        self.notifier.network_changed(network_id);
        Ok(())
    }

    pub fn add_rule(&self, network_id: Uuid, policy_id: Uuid, spec: RuleSpec) -> Result<Policy> {
        let policy = self.db.transaction(|s| {
            let mut policy: Policy = s.require(network_id, policy_id)?;
            policy.rules.push(build_rule(s, network_id, spec)?);
            policy.updated_at = now_epoch_secs();
            s.put(&policy)?;
            Ok(policy)
        })?;

        self.notifier.network_changed(network_id);
        Ok(policy)
    }

    pub fn remove_rule(&self, network_id: Uuid, policy_id: Uuid, rule_id: Uuid) -> Result<Policy> {
        let policy = self.db.transaction(|s| {
            let mut policy: Policy = s.require(network_id, policy_id)?;
            let before = policy.rules.len();
            policy.rules.retain(|r| r.id != rule_id);
            if policy.rules.len() == before {
                return Err(Error::not_found("rule", rule_id));
            }
            policy.updated_at = now_epoch_secs();
            s.put(&policy)?;
            Ok(policy)
        })?;

        self.notifier.network_changed(network_id);
        Ok(policy)
    }

    // ========================================================================
    // Routes
    // ========================================================================

    pub fn create_route(&self, network_id: Uuid, req: CreateRoute) -> Result<Route> {
        let name = validate_label(&req.name)?;
        let destination_cidr = parse_cidr("destination_cidr", &req.destination_cidr)?;
        let domain_suffix = match req.domain_suffix.as_deref() {
            Some(d) => validate_domain(d)?,
            None => DEFAULT_ROUTE_DOMAIN.to_string(),
        };

        let route = self.db.transaction(|s| {
            s.require_network(network_id)?;
            check_route_gateway(
                network_id,
                req.jump_peer_id,
                s.get::<Peer>(req.jump_peer_id)?.as_ref(),
            )?;
            s.ensure_unique_name::<Route>(network_id, &name, None)?;

            let now = now_epoch_secs();
            let route = Route {
                id: Uuid::new_v4(),
                network_id,
                name,
                description: req.description,
                destination_cidr,
                jump_peer_id: req.jump_peer_id,
                domain_suffix,
                created_at: now,
                updated_at: now,
            };
            s.put(&route)?;
            Ok(route)
        })?;

        info!(
            "Created route '{}' {} via {}",
            route.name, route.destination_cidr, route.jump_peer_id
        );
        // The gateway now serves a new destination
        self.notifier.peer_changed(network_id, route.jump_peer_id);
        Ok(route)
    }

    pub fn get_route(&self, network_id: Uuid, route_id: Uuid) -> Result<Route> {
        self.db.read(|s| s.require(network_id, route_id))
    }

    pub fn list_routes(&self, network_id: Uuid) -> Result<Vec<Route>> {
        self.db.read(|s| {
            s.require_network(network_id)?;
            s.list(network_id)
        })
    }

    pub fn update_route(&self, network_id: Uuid, route_id: Uuid, req: UpdateRoute) -> Result<Route> {
        let name = req.name.as_deref().map(validate_label).transpose()?;
        let destination = req
            .destination_cidr
            .as_deref()
            .map(|c| parse_cidr("destination_cidr", c))
            .transpose()?;
        let domain_suffix = req.domain_suffix.as_deref().map(validate_domain).transpose()?;

        let route = self.db.transaction(|s| {
            let mut route: Route = s.require(network_id, route_id)?;

            if let Some(name) = name {
                s.ensure_unique_name::<Route>(network_id, &name, Some(route_id))?;
                route.name = name;
            }
            if let Some(description) = req.description {
                route.description = description;
            }
            if let Some(suffix) = domain_suffix {
                route.domain_suffix = suffix;
            }
            if let Some(destination) = destination {
                route.destination_cidr = destination;
                for mapping in s.list_dns_mappings(route_id)? {
                    check_dns_mapping(&route, mapping.ip_address)?;
                }
            }
            if let Some(jump) = req.jump_peer_id {
                check_route_gateway(network_id, jump, s.get::<Peer>(jump)?.as_ref())?;
                route.jump_peer_id = jump;
                // Every group carrying the route must stay loop free
                for group in s.list::<Group>(network_id)? {
                    if group.route_ids.contains(&route_id) {
                        let others: Vec<Route> = group
                            .route_ids
                            .iter()
                            .filter(|id| **id != route_id)
                            .map(|id| s.require::<Route>(network_id, *id))
                            .collect::<Result<_>>()?;
                        check_group_routing(
                            &group,
                            &group.peer_ids,
                            others.iter().chain(std::iter::once(&route)),
                            |id| peer_label(s, id),
                        )?;
                    }
                }
            }

            route.updated_at = now_epoch_secs();
            s.put(&route)?;
            Ok(route)
        })?;

        self.notifier.network_changed(network_id);
        Ok(route)
    }

    pub fn delete_route(&self, network_id: Uuid, route_id: Uuid) -> Result<()> {
        self.db.transaction(|s| {
            s.require::<Route>(network_id, route_id)?;
            for mut group in s.list::<Group>(network_id)? {
                if group.route_ids.remove(&route_id) {
                    group.touch();
                    s.put(&group)?;
                }
            }
            s.delete_route_dns_mappings(route_id)?;
            s.delete::<Route>(route_id)?;
            Ok(())
        })?;

        self.notifier.network_changed(network_id);
        Ok(())
    }

    // ========================================================================
    // DNS mappings
    // ========================================================================

    pub fn create_dns_mapping(&self, network_id: Uuid, route_id: Uuid, req: CreateDnsMapping) -> Result<DnsMappingView> {
        let name = validate_label(&req.name)?;

        let view = self.db.transaction(|s| {
            let route: Route = s.require(network_id, route_id)?;
            check_dns_mapping(&route, req.ip_address)?;
            if s.find_dns_mapping_by_name(route_id, &name)?.is_some() {
                return Err(Error::AlreadyExists {
                    kind: "dns mapping".into(),
                    name,
                });
            }

            let now = now_epoch_secs();
            let mapping = DnsMapping {
                id: Uuid::new_v4(),
                network_id,
                route_id,
                name,
                ip_address: req.ip_address,
                created_at: now,
                updated_at: now,
            };
            s.put_dns_mapping(&mapping)?;
            Ok(DnsMappingView {
                fqdn: mapping.fqdn(&route),
                mapping,
            })
        })?;

        self.notifier.network_changed(network_id);
        Ok(view)
    }

    pub fn list_dns_mappings(&self, network_id: Uuid, route_id: Uuid) -> Result<Vec<DnsMappingView>> {
        self.db.read(|s| {
            let route: Route = s.require(network_id, route_id)?;
            Ok(s.list_dns_mappings(route_id)?
                .into_iter()
                .map(|mapping| DnsMappingView {
                    fqdn: mapping.fqdn(&route),
                    mapping,
                })
                .collect())
        })
    }

    pub fn update_dns_mapping(
        &self,
        network_id: Uuid,
        route_id: Uuid,
        mapping_id: Uuid,
        req: UpdateDnsMapping,
    ) -> Result<DnsMappingView> {
        let name = req.name.as_deref().map(validate_label).transpose()?;

        let view = self.db.transaction(|s| {
            let route: Route = s.require(network_id, route_id)?;
            let mut mapping = s
                .get_dns_mapping(mapping_id)?
                .filter(|m| m.route_id == route_id)
                .ok_or_else(|| Error::not_found("dns mapping", mapping_id))?;

            if let Some(name) = name {
                if let Some(other) = s.find_dns_mapping_by_name(route_id, &name)? {
                    if other.id != mapping_id {
                        return Err(Error::AlreadyExists {
                            kind: "dns mapping".into(),
                            name,
                        });
                    }
                }
                mapping.name = name;
            }
            if let Some(ip) = req.ip_address {
                check_dns_mapping(&route, ip)?;
                mapping.ip_address = ip;
            }
            mapping.updated_at = now_epoch_secs();
            s.put_dns_mapping(&mapping)?;
            Ok(DnsMappingView {
                fqdn: mapping.fqdn(&route),
                mapping,
            })
        })?;

        self.notifier.network_changed(network_id);
        Ok(view)
    }

    pub fn delete_dns_mapping(&self, network_id: Uuid, route_id: Uuid, mapping_id: Uuid) -> Result<()> {
        self.db.transaction(|s| {
            s.require::<Route>(network_id, route_id)?;
            match s.get_dns_mapping(mapping_id)? {
                Some(m) if m.route_id == route_id => s.delete_dns_mapping(mapping_id).map(|_| ()),
                _ => Err(Error::not_found("dns mapping", mapping_id)),
            }
        })?;

        self.notifier.network_changed(network_id);
        Ok(())
    }

    // ========================================================================
    // CIDR suggestion
    // ========================================================================

    pub fn suggest_cidrs(&self, base_cidr: &str, max_peers: u64, count: usize) -> Result<CidrSuggestion> {
        let base = parse_cidr("base_cidr", base_cidr)?;
        let mut reserved = self.options.reserved_cidrs.clone();
        if self.options.reserve_existing_networks {
            reserved.extend(self.list_networks()?.into_iter().map(|n| n.cidr));
        }
        cidr::suggest_cidrs(base, max_peers, count, &reserved)
    }
}
