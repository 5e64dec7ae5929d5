//! Core domain types for netmesh
//!
//! Entities are stored as JSON documents (see [`crate::db`]) so every type
//! here is serde round-trippable. Collections that end up in compiled peer
//! configuration use ordered containers so output is deterministic.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use uuid::Uuid;

/// Lowest allowed priority for user groups (quarantine alone sits at 0).
pub const MIN_GROUP_PRIORITY: u16 = 1;
/// Highest allowed priority for user groups.
pub const MAX_GROUP_PRIORITY: u16 = 999;
pub const QUARANTINE_PRIORITY: u16 = 0;
pub const DEFAULT_GROUP_PRIORITY: u16 = MAX_GROUP_PRIORITY;

pub const DEFAULT_GROUP_NAME: &str = "default";
pub const QUARANTINE_GROUP_NAME: &str = "quarantine";
pub const DEFAULT_ROUTE_DOMAIN: &str = "internal";

pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Network
// ============================================================================

/// An isolated virtual network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    pub name: String,
    pub cidr: IpNetwork,
    /// DNS zone suffix for peer records, e.g. `corp.mesh`
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Peer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    /// Single host inside the network CIDR
    pub address: IpAddr,
    pub public_key: String,
    #[serde(default)]
    pub is_jump: bool,
    /// None for admin-managed peers
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Last-known public endpoint (`ip:port`)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Group
// ============================================================================

/// Marker for the two groups every network is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservedGroup {
    Default,
    Quarantine,
}

impl ReservedGroup {
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => DEFAULT_GROUP_NAME,
            Self::Quarantine => QUARANTINE_GROUP_NAME,
        }
    }

    pub fn priority(self) -> u16 {
        match self {
            Self::Default => DEFAULT_GROUP_PRIORITY,
            Self::Quarantine => QUARANTINE_PRIORITY,
        }
    }
}

/// A prioritized bundle of peers, policies and routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lower value is evaluated first
    pub priority: u16,
    #[serde(default)]
    pub reserved: Option<ReservedGroup>,
    #[serde(default)]
    pub peer_ids: BTreeSet<Uuid>,
    /// Evaluation order of attached policies
    #[serde(default)]
    pub policy_ids: Vec<Uuid>,
    #[serde(default)]
    pub route_ids: BTreeSet<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Group {
    pub fn new(network_id: Uuid, name: &str, description: &str, priority: u16) -> Self {
        let now = now_epoch_secs();
        Self {
            id: Uuid::new_v4(),
            network_id,
            name: name.to_string(),
            description: description.to_string(),
            priority,
            reserved: None,
            peer_ids: BTreeSet::new(),
            policy_ids: Vec::new(),
            route_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reserved(network_id: Uuid, kind: ReservedGroup) -> Self {
        let description = match kind {
            ReservedGroup::Default => "Peers not assigned to any other group",
            ReservedGroup::Quarantine => "Isolated peers",
        };
        let mut group = Self::new(network_id, kind.name(), description, kind.priority());
        group.reserved = Some(kind);
        group
    }

    pub fn is_quarantine(&self) -> bool {
        self.reserved == Some(ReservedGroup::Quarantine)
    }

    pub fn touch(&mut self) {
        self.updated_at = now_epoch_secs();
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Cidr,
    Peer,
    Group,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cidr => write!(f, "cidr"),
            Self::Peer => write!(f, "peer"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Parsed form of a rule's `target` string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    Cidr(IpNetwork),
    Peer(Uuid),
    Group(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: Uuid,
    pub direction: Direction,
    pub action: Action,
    pub target_type: TargetType,
    /// CIDR, peer id or group id depending on `target_type`
    pub target: String,
    #[serde(default)]
    pub description: String,
}

impl PolicyRule {
    pub fn parse_target(&self) -> crate::Result<RuleTarget> {
        let bad = |e: &dyn std::fmt::Display| {
            crate::Error::validation(format!(
                "invalid {} target '{}': {}",
                self.target_type, self.target, e
            ))
        };
        match self.target_type {
            TargetType::Cidr => self
                .target
                .parse::<IpNetwork>()
                .map(RuleTarget::Cidr)
                .map_err(|e| bad(&e)),
            TargetType::Peer => Uuid::parse_str(&self.target)
                .map(RuleTarget::Peer)
                .map_err(|e| bad(&e)),
            TargetType::Group => Uuid::parse_str(&self.target)
                .map(RuleTarget::Group)
                .map_err(|e| bad(&e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Route and DNS
// ============================================================================

/// Gateway route: traffic for `destination_cidr` goes through `jump_peer_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub destination_cidr: IpNetwork,
    pub jump_peer_id: Uuid,
    #[serde(default = "default_route_domain")]
    pub domain_suffix: String,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_route_domain() -> String {
    DEFAULT_ROUTE_DOMAIN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsMapping {
    pub id: Uuid,
    pub network_id: Uuid,
    pub route_id: Uuid,
    pub name: String,
    pub ip_address: IpAddr,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DnsMapping {
    /// `<mapping>.<route>.<suffix>`
    pub fn fqdn(&self, route: &Route) -> String {
        format!("{}.{}.{}", self.name, route.name, route.domain_suffix)
    }
}

// ============================================================================
// Security
// ============================================================================

/// Per-network thresholds consumed by incident detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub network_id: Uuid,
    pub enabled: bool,
    pub session_conflict_threshold_secs: u64,
    pub endpoint_change_threshold_secs: u64,
    pub max_endpoint_changes_per_day: u32,
}

impl SecurityConfig {
    pub fn default_for(network_id: Uuid) -> Self {
        Self {
            network_id,
            enabled: true,
            session_conflict_threshold_secs: 300,
            endpoint_change_threshold_secs: 600,
            max_endpoint_changes_per_day: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    SessionConflict,
    RapidEndpointChange,
    ExcessiveEndpointChanges,
}

impl std::fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionConflict => write!(f, "session_conflict"),
            Self::RapidEndpointChange => write!(f, "rapid_endpoint_change"),
            Self::ExcessiveEndpointChanges => write!(f, "excessive_endpoint_changes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub id: Uuid,
    pub network_id: Uuid,
    pub peer_id: Uuid,
    pub kind: IncidentKind,
    pub detail: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub detected_at: i64,
    #[serde(default)]
    pub resolved: bool,
}

// ============================================================================
// Captive portal whitelist
// ============================================================================

/// A client admitted through a jump peer's captive portal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub network_id: Uuid,
    pub jump_peer_id: Uuid,
    pub ip: IpAddr,
    pub created_at: i64,
}

// ============================================================================
// Users and sessions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub authorized_networks: BTreeSet<Uuid>,
    pub created_at: i64,
}

impl User {
    pub fn can_access(&self, network_id: Uuid) -> bool {
        self.is_admin || self.authorized_networks.contains(&network_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: i64,
    pub created_at: i64,
}
