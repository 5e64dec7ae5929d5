//! CIDR carving and host allocation
//!
//! Carves candidate sub-blocks out of a base block and hands out single
//! host addresses inside a network. Pure functions, no I/O.

use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Result of [`suggest_cidrs`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrSuggestion {
    pub prefix: u8,
    /// Saturates at `u64::MAX` for very large IPv6 blocks
    pub usable_hosts: u64,
    pub cidrs: Vec<IpNetwork>,
}

fn family_bits(net: &IpNetwork) -> u8 {
    match net {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

fn addr_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_addr(val: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(val as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(val))
    }
}

/// Usable host addresses in a block of the given prefix.
///
/// IPv4 excludes the network and broadcast addresses; IPv6 has no such
/// adjustment.
pub fn usable_hosts(bits: u8, prefix: u8) -> u128 {
    let host_bits = u32::from(bits.saturating_sub(prefix));
    let size = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
    if bits == 32 {
        size.saturating_sub(2)
    } else {
        size
    }
}

/// True if the two blocks share any address. Blocks of different families
/// never overlap.
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(_), IpNetwork::V4(_)) | (IpNetwork::V6(_), IpNetwork::V6(_)) => {
            a.contains(b.network()) || b.contains(a.network())
        }
        _ => false,
    }
}

/// Normalize a block so its address is the network address (`10.0.0.7/24`
/// becomes `10.0.0.0/24`).
pub fn normalize(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Suggest `count` non-overlapping sub-blocks of `base`, each large enough
/// for `max_peers` hosts, skipping anything that overlaps `reserved`.
///
/// The prefix is the smallest prefix length strictly longer than the base
/// prefix whose usable host count reaches `max_peers`. Candidates are
/// enumerated in ascending address order.
pub fn suggest_cidrs(
    base: IpNetwork,
    max_peers: u64,
    count: usize,
    reserved: &[IpNetwork],
) -> Result<CidrSuggestion> {
    if max_peers == 0 {
        return Err(Error::validation("max_peers must be at least 1"));
    }
    if count == 0 {
        return Err(Error::validation("count must be at least 1"));
    }

    let base = normalize(base);
    let bits = family_bits(&base);
    let is_v4 = bits == 32;

    let prefix = ((base.prefix() + 1)..=bits)
        .find(|&p| usable_hosts(bits, p) >= u128::from(max_peers))
        .ok_or_else(|| Error::Capacity {
            requested: max_peers,
            available: if base.prefix() < bits {
                u64::try_from(usable_hosts(bits, base.prefix() + 1)).unwrap_or(u64::MAX)
            } else {
                0
            },
        })?;

    let block = 1u128
        .checked_shl(u32::from(bits - prefix))
        .unwrap_or(u128::MAX);
    let start = addr_to_u128(base.network());
    // Last address of the base block, inclusive
    let end = start
        + 1u128
            .checked_shl(u32::from(bits - base.prefix()))
            .map(|size| size - 1)
            .unwrap_or(u128::MAX);

    let mut cidrs = Vec::with_capacity(count);
    let mut cursor = start;
    while cidrs.len() < count && cursor <= end && end - cursor >= block - 1 {
        let candidate = IpNetwork::new(u128_to_addr(cursor, is_v4), prefix)
            .map_err(|e| Error::Internal(format!("bad candidate block: {}", e)))?;

        let blocker = reserved
            .iter()
            .filter(|r| overlaps(&candidate, r))
            .map(|r| last_address(r))
            .max();

        match blocker {
            None => {
                cidrs.push(candidate);
                match cursor.checked_add(block) {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            Some(reserved_end) => {
                // Jump past the reserved block, realigned to the block size
                let past = match reserved_end.checked_add(1) {
                    Some(v) => v,
                    None => break,
                };
                let aligned = past.div_ceil(block).checked_mul(block);
                match aligned {
                    Some(next) if next > cursor => cursor = next,
                    _ => break,
                }
            }
        }
    }

    if cidrs.len() < count {
        return Err(Error::Exhausted {
            requested: count,
            found: cidrs.len(),
        });
    }

    Ok(CidrSuggestion {
        prefix,
        usable_hosts: u64::try_from(usable_hosts(bits, prefix)).unwrap_or(u64::MAX),
        cidrs,
    })
}

fn last_address(net: &IpNetwork) -> u128 {
    let bits = family_bits(net);
    let size = 1u128
        .checked_shl(u32::from(bits - net.prefix()))
        .unwrap_or(0);
    addr_to_u128(net.network()).saturating_add(size.wrapping_sub(1))
}

/// True if `ip` is an assignable host of `net` (inside the block and, for
/// IPv4 blocks larger than /31, not the network or broadcast address).
pub fn is_assignable_host(net: &IpNetwork, ip: IpAddr) -> bool {
    if !net.contains(ip) {
        return false;
    }
    match net {
        IpNetwork::V4(v4) if v4.prefix() < 31 => {
            ip != IpAddr::V4(v4.network()) && ip != IpAddr::V4(v4.broadcast())
        }
        IpNetwork::V6(v6) if v6.prefix() < 128 => ip != IpAddr::V6(v6.network()),
        _ => true,
    }
}

/// Pick the lowest assignable host of `net` not present in `used`.
pub fn allocate_host(net: &IpNetwork, used: &BTreeSet<IpAddr>) -> Result<IpAddr> {
    let net = normalize(*net);
    let is_v4 = matches!(net, IpNetwork::V4(_));
    let first = addr_to_u128(net.network());
    let last = last_address(&net);

    let mut cursor = first;
    loop {
        let ip = u128_to_addr(cursor, is_v4);
        if is_assignable_host(&net, ip) && !used.contains(&ip) {
            return Ok(ip);
        }
        if cursor >= last {
            break;
        }
        cursor += 1;
    }

    Err(Error::Exhausted {
        requested: 1,
        found: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_suggest_fits_fifty_peers_in_slash_25() {
        let s = suggest_cidrs(net("10.0.0.0/24"), 50, 1, &[]).unwrap();
        assert_eq!(s.prefix, 25);
        assert_eq!(s.usable_hosts, 126);
        assert_eq!(s.cidrs, vec![net("10.0.0.0/25")]);
    }

    #[test]
    fn test_suggest_capacity_error() {
        let err = suggest_cidrs(net("10.0.0.0/24"), 130, 1, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity { requested: 130, available: 126 }
        ));
    }

    #[test]
    fn test_suggest_skips_reserved() {
        let s = suggest_cidrs(net("10.0.0.0/24"), 50, 1, &[net("10.0.0.64/26")]).unwrap();
        assert_eq!(s.cidrs, vec![net("10.0.0.128/25")]);
    }

    #[test]
    fn test_suggest_exhausted() {
        let err = suggest_cidrs(net("10.0.0.0/24"), 50, 3, &[]).unwrap_err();
        assert!(matches!(err, Error::Exhausted { requested: 3, found: 2 }));

        let err = suggest_cidrs(net("10.0.0.0/24"), 50, 1, &[net("10.0.0.0/16")]).unwrap_err();
        assert!(matches!(err, Error::Exhausted { requested: 1, found: 0 }));
    }

    #[test]
    fn test_suggest_ascending_order_and_normalizes_base() {
        let s = suggest_cidrs(net("10.8.3.9/16"), 1000, 2, &[]).unwrap();
        assert_eq!(s.prefix, 17);
        assert_eq!(s.cidrs, vec![net("10.8.0.0/17"), net("10.8.128.0/17")]);
    }

    #[test]
    fn test_suggest_ipv6_has_no_reserved_hosts() {
        let s = suggest_cidrs(net("fd00::/120"), 128, 2, &[]).unwrap();
        assert_eq!(s.prefix, 121);
        assert_eq!(s.usable_hosts, 128);
        assert_eq!(s.cidrs, vec![net("fd00::/121"), net("fd00::80/121")]);
    }

    #[test]
    fn test_suggest_rejects_zero_inputs() {
        assert!(matches!(
            suggest_cidrs(net("10.0.0.0/24"), 0, 1, &[]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            suggest_cidrs(net("10.0.0.0/24"), 10, 0, &[]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps(&net("10.0.0.0/24"), &net("10.0.0.128/25")));
        assert!(overlaps(&net("10.0.0.128/25"), &net("10.0.0.0/16")));
        assert!(!overlaps(&net("10.0.0.0/25"), &net("10.0.0.128/25")));
        assert!(!overlaps(&net("10.0.0.0/8"), &net("fd00::/8")));
    }

    #[test]
    fn test_allocate_host_skips_used_and_network_address() {
        let n = net("10.0.0.0/29");
        let mut used = BTreeSet::new();
        assert_eq!(allocate_host(&n, &used).unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());

        used.insert("10.0.0.1".parse().unwrap());
        used.insert("10.0.0.2".parse().unwrap());
        assert_eq!(allocate_host(&n, &used).unwrap(), "10.0.0.3".parse::<IpAddr>().unwrap());

        for i in 3..=6 {
            used.insert(format!("10.0.0.{}", i).parse().unwrap());
        }
        // .7 is broadcast
        assert!(matches!(allocate_host(&n, &used), Err(Error::Exhausted { .. })));
    }

    #[test]
    fn test_assignable_host() {
        let n = net("10.0.0.0/24");
        assert!(is_assignable_host(&n, "10.0.0.10".parse().unwrap()));
        assert!(!is_assignable_host(&n, "10.0.0.0".parse().unwrap()));
        assert!(!is_assignable_host(&n, "10.0.0.255".parse().unwrap()));
        assert!(!is_assignable_host(&n, "10.0.1.1".parse().unwrap()));
    }
}
