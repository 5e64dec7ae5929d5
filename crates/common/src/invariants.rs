//! Consistency rules for groups, routes and DNS mappings
//!
//! Every mutation path calls into these functions instead of re-implementing
//! the checks, so "add peer to group" and "attach route to group" always agree
//! on what a circular route is.

use crate::types::{Group, Peer, ReservedGroup, Route, MAX_GROUP_PRIORITY, MIN_GROUP_PRIORITY};
use crate::{Error, Result};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use uuid::Uuid;

/// Reject a group state where any attached route's gateway is also a member.
///
/// `members` and `routes` are the *prospective* member and route sets, i.e.
/// what the group would look like after the mutation being validated.
/// `peer_name` resolves a peer id for the error message.
pub fn check_group_routing<'a, I, F>(
    group: &Group,
    members: &BTreeSet<Uuid>,
    routes: I,
    peer_name: F,
) -> Result<()>
where
    I: IntoIterator<Item = &'a Route>,
    F: Fn(Uuid) -> String,
{
    for route in routes {
        if members.contains(&route.jump_peer_id) {
            return Err(Error::CircularRouting {
                group: group.name.clone(),
                route: route.name.clone(),
                peer: peer_name(route.jump_peer_id),
            });
        }
    }
    Ok(())
}

/// A route's gateway must be an existing jump peer of the same network.
pub fn check_route_gateway(route_network: Uuid, jump_peer_id: Uuid, peer: Option<&Peer>) -> Result<()> {
    let peer = peer.ok_or_else(|| Error::not_found("peer", jump_peer_id))?;
    if peer.network_id != route_network {
        return Err(Error::validation(format!(
            "jump peer '{}' belongs to a different network",
            peer.name
        )));
    }
    if !peer.is_jump {
        return Err(Error::validation(format!(
            "peer '{}' is not a jump peer and cannot be a route gateway",
            peer.name
        )));
    }
    Ok(())
}

/// A DNS mapping must point inside its route's destination block.
pub fn check_dns_mapping(route: &Route, ip: IpAddr) -> Result<()> {
    if route.destination_cidr.contains(ip) {
        Ok(())
    } else {
        Err(Error::DnsMappingOutOfRange {
            ip: ip.to_string(),
            cidr: route.destination_cidr.to_string(),
        })
    }
}

pub fn check_priority(priority: u16) -> Result<()> {
    if (MIN_GROUP_PRIORITY..=MAX_GROUP_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "group priority must be between {} and {} (got {})",
            MIN_GROUP_PRIORITY, MAX_GROUP_PRIORITY, priority
        )))
    }
}

/// Validate a rename / re-prioritization against the reserved-group rules.
///
/// Setting a field to its current value is not a change and is accepted.
pub fn check_group_update(group: &Group, name: Option<&str>, priority: Option<u16>) -> Result<()> {
    let entity = format!("group '{}'", group.name);

    if let Some(name) = name {
        if name != group.name && group.reserved.is_some() {
            return Err(Error::immutable(entity, "name"));
        }
    }

    if let Some(priority) = priority {
        if priority != group.priority {
            if group.reserved == Some(ReservedGroup::Quarantine) {
                return Err(Error::immutable(entity, "priority"));
            }
            check_priority(priority)?;
        }
    }

    Ok(())
}

/// A reorder must be a permutation of the currently attached policy ids.
pub fn check_policy_order(current: &[Uuid], proposed: &[Uuid]) -> Result<()> {
    let mut seen = HashSet::with_capacity(proposed.len());
    for id in proposed {
        if !seen.insert(*id) {
            return Err(Error::InvalidOrder(format!("policy {} listed more than once", id)));
        }
    }

    let current_set: HashSet<Uuid> = current.iter().copied().collect();
    if let Some(foreign) = proposed.iter().find(|id| !current_set.contains(id)) {
        return Err(Error::InvalidOrder(format!(
            "policy {} is not attached to this group",
            foreign
        )));
    }
    if let Some(missing) = current.iter().find(|id| !seen.contains(id)) {
        return Err(Error::InvalidOrder(format!(
            "attached policy {} is missing from the new order",
            missing
        )));
    }
    Ok(())
}
