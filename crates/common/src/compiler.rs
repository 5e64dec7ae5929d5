//! Per-peer configuration compiler
//!
//! Turns a [`NetworkSnapshot`] into the [`PeerConfig`] artifact pushed to one
//! agent. Compilation never mutates anything and every collection in the
//! output is sorted, so the same snapshot always serializes to the same bytes.

use crate::types::{
    Action, Direction, DnsMapping, Group, Network, Peer, Policy, Route, RuleTarget,
    WhitelistEntry,
};
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::warn;
use uuid::Uuid;

/// Everything the compiler needs to know about one network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub network: Option<Network>,
    pub peers: Vec<Peer>,
    pub groups: Vec<Group>,
    pub policies: Vec<Policy>,
    pub routes: Vec<Route>,
    pub dns_mappings: Vec<DnsMapping>,
    pub whitelist: Vec<WhitelistEntry>,
}

/// Knobs that come from service configuration rather than network state
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Set only when network-wide authentication is enabled
    pub oauth_issuer: Option<String>,
    pub keepalive_secs: Option<u16>,
}

// ============================================================================
// Output artifact
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub config: TopologyConfig,
    pub dns: Vec<DnsRecord>,
    pub policy: FirewallPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<IpAddr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_issuer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<RemotePeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub peer_id: Uuid,
    pub name: String,
    /// Host address with the network prefix, e.g. `10.0.0.5/24`
    pub address: IpNetwork,
    pub public_key: String,
    pub is_jump: bool,
    pub quarantined: bool,
    /// Destinations this peer forwards for (jump peers only)
    pub gateway_routes: Vec<IpNetwork>,
    pub dns_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub peer_id: Uuid,
    pub name: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNetwork>,
    pub is_jump: bool,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub ip: IpAddr,
}

/// How the agent must evaluate `rules`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEvaluation {
    /// The first rule whose direction and target match decides
    FirstMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub evaluation: RuleEvaluation,
    /// Applied when no rule matches
    pub default_action: Action,
    pub rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub group_id: Uuid,
    pub group_name: String,
    pub priority: u16,
    pub policy_id: Uuid,
    pub policy_name: String,
    pub rule_id: Uuid,
    pub direction: Direction,
    pub action: Action,
    pub targets: Vec<IpNetwork>,
    pub description: String,
}

// ============================================================================
// Compilation
// ============================================================================

fn host_network(ip: IpAddr) -> IpNetwork {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    // A full-length prefix is always valid
    IpNetwork::new(ip, prefix).unwrap_or_else(|_| IpNetwork::from(ip))
}

fn sort_networks(nets: &mut Vec<IpNetwork>) {
    nets.sort_by_key(|n| (n.ip(), n.prefix()));
    nets.dedup();
}

struct Index<'a> {
    peers: HashMap<Uuid, &'a Peer>,
    groups: HashMap<Uuid, &'a Group>,
    policies: HashMap<Uuid, &'a Policy>,
    routes: HashMap<Uuid, &'a Route>,
    quarantined: BTreeSet<Uuid>,
}

impl<'a> Index<'a> {
    fn new(snapshot: &'a NetworkSnapshot) -> Self {
        let quarantined = snapshot
            .groups
            .iter()
            .filter(|g| g.is_quarantine())
            .flat_map(|g| g.peer_ids.iter().copied())
            .collect();
        Self {
            peers: snapshot.peers.iter().map(|p| (p.id, p)).collect(),
            groups: snapshot.groups.iter().map(|g| (g.id, g)).collect(),
            policies: snapshot.policies.iter().map(|p| (p.id, p)).collect(),
            routes: snapshot.routes.iter().map(|r| (r.id, r)).collect(),
            quarantined,
        }
    }

    fn group_addresses(&self, group_id: Uuid) -> Vec<IpNetwork> {
        self.groups
            .get(&group_id)
            .map(|g| {
                g.peer_ids
                    .iter()
                    .filter_map(|id| self.peers.get(id))
                    .map(|p| host_network(p.address))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn resolve_target(&self, target: RuleTarget) -> Vec<IpNetwork> {
        let mut nets = match target {
            RuleTarget::Cidr(cidr) => vec![crate::cidr::normalize(cidr)],
            RuleTarget::Peer(id) => self
                .peers
                .get(&id)
                .map(|p| vec![host_network(p.address)])
                .unwrap_or_default(),
            RuleTarget::Group(id) => self.group_addresses(id),
        };
        sort_networks(&mut nets);
        nets
    }
}

/// Compile the configuration for `peer_id` from `snapshot`.
pub fn compile(peer_id: Uuid, snapshot: &NetworkSnapshot, opts: &CompileOptions) -> Result<PeerConfig> {
    let network = snapshot
        .network
        .as_ref()
        .ok_or_else(|| Error::Internal("snapshot has no network".to_string()))?;
    let index = Index::new(snapshot);
    let peer = *index
        .peers
        .get(&peer_id)
        .ok_or_else(|| Error::not_found("peer", peer_id))?;
    let quarantined = index.quarantined.contains(&peer.id);

    // Groups containing the peer, highest precedence first
    let mut member_groups: Vec<&Group> = snapshot
        .groups
        .iter()
        .filter(|g| g.peer_ids.contains(&peer.id))
        .collect();
    member_groups.sort_by(|a, b| (a.priority, &a.name, a.id).cmp(&(b.priority, &b.name, b.id)));

    // Routes reachable through any of those groups
    let mut reachable: Vec<&Route> = member_groups
        .iter()
        .flat_map(|g| g.route_ids.iter())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|id| index.routes.get(id).copied())
        .collect();
    reachable.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
    if quarantined {
        reachable.clear();
    }

    let config = compile_topology(network, peer, quarantined, &reachable, snapshot, &index, opts)?;
    let policy = compile_firewall(&member_groups, &index);
    let dns = compile_dns(network, &reachable, snapshot, &index);

    let whitelist = peer.is_jump.then(|| {
        let ips: BTreeSet<IpAddr> = snapshot
            .whitelist
            .iter()
            .filter(|w| w.jump_peer_id == peer.id)
            .map(|w| w.ip)
            .collect();
        ips.into_iter().collect()
    });

    Ok(PeerConfig {
        config,
        dns,
        policy,
        whitelist,
        oauth_issuer: opts.oauth_issuer.clone(),
    })
}

fn compile_topology(
    network: &Network,
    peer: &Peer,
    quarantined: bool,
    reachable: &[&Route],
    snapshot: &NetworkSnapshot,
    index: &Index<'_>,
    opts: &CompileOptions,
) -> Result<TopologyConfig> {
    let address = IpNetwork::new(peer.address, network.cidr.prefix())
        .map_err(|e| Error::Internal(format!("peer address {}: {}", peer.address, e)))?;

    let mut gateway_routes: Vec<IpNetwork> = if peer.is_jump {
        snapshot
            .routes
            .iter()
            .filter(|r| r.jump_peer_id == peer.id)
            .map(|r| crate::cidr::normalize(r.destination_cidr))
            .collect()
    } else {
        Vec::new()
    };
    sort_networks(&mut gateway_routes);

    let mut remotes: Vec<RemotePeer> = Vec::new();
    if !quarantined {
        let mut others: Vec<&Peer> = snapshot
            .peers
            .iter()
            .filter(|p| p.id != peer.id && !index.quarantined.contains(&p.id))
            .collect();
        others.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));

        for other in others {
            let mut allowed_ips = vec![host_network(other.address)];
            allowed_ips.extend(
                reachable
                    .iter()
                    .filter(|r| r.jump_peer_id == other.id)
                    .map(|r| crate::cidr::normalize(r.destination_cidr)),
            );
            sort_networks(&mut allowed_ips);

            remotes.push(RemotePeer {
                peer_id: other.id,
                name: other.name.clone(),
                public_key: other.public_key.clone(),
                endpoint: other.endpoint.clone(),
                allowed_ips,
                is_jump: other.is_jump,
                persistent_keepalive: opts.keepalive_secs,
            });
        }
    }

    Ok(TopologyConfig {
        interface: InterfaceConfig {
            peer_id: peer.id,
            name: peer.name.clone(),
            address,
            public_key: peer.public_key.clone(),
            is_jump: peer.is_jump,
            quarantined,
            gateway_routes,
            dns_domain: network.domain.clone(),
        },
        peers: remotes,
    })
}

fn compile_firewall(member_groups: &[&Group], index: &Index<'_>) -> FirewallPolicy {
    let mut rules = Vec::new();

    for group in member_groups {
        for policy_id in &group.policy_ids {
            let Some(policy) = index.policies.get(policy_id) else {
                continue;
            };
            for rule in &policy.rules {
                let target = match rule.parse_target() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Skipping rule {} of policy '{}': {}", rule.id, policy.name, e);
                        continue;
                    }
                };
                rules.push(CompiledRule {
                    group_id: group.id,
                    group_name: group.name.clone(),
                    priority: group.priority,
                    policy_id: policy.id,
                    policy_name: policy.name.clone(),
                    rule_id: rule.id,
                    direction: rule.direction,
                    action: rule.action,
                    targets: index.resolve_target(target),
                    description: rule.description.clone(),
                });
            }
        }
    }

    FirewallPolicy {
        evaluation: RuleEvaluation::FirstMatch,
        default_action: Action::Allow,
        rules,
    }
}

fn compile_dns(
    network: &Network,
    reachable: &[&Route],
    snapshot: &NetworkSnapshot,
    index: &Index<'_>,
) -> Vec<DnsRecord> {
    let mut records: Vec<DnsRecord> = snapshot
        .peers
        .iter()
        .filter(|p| !index.quarantined.contains(&p.id))
        .map(|p| DnsRecord {
            name: format!("{}.{}", p.name, network.domain),
            ip: p.address,
        })
        .collect();

    for route in reachable {
        records.extend(
            snapshot
                .dns_mappings
                .iter()
                .filter(|m| m.route_id == route.id)
                .map(|m| DnsRecord {
                    name: m.fqdn(route),
                    ip: m.ip_address,
                }),
        );
    }

    records.sort_by(|a, b| (&a.name, a.ip).cmp(&(&b.name, b.ip)));
    records.dedup();
    records
}
