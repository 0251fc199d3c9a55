//! Address classification helpers
//!
//! Parsing of client addresses and CIDR rules, CIDR membership and
//! local-network classification. Pure functions, no I/O.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::error::ValidationError;

/// Coarse classification of a client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    /// RFC1918, CGNAT (100.64.0.0/10) or IPv6 ULA (fc00::/7)
    Private,
    LinkLocal,
    Public,
}

impl AddressClass {
    /// True for everything that never leaves the local network
    pub fn is_local(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// Parse an IPv4 or IPv6 literal. Surrounding whitespace and IPv6 brackets are accepted.
pub fn parse_addr(input: &str) -> Result<IpAddr, ValidationError> {
    let trimmed = input.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    unbracketed
        .parse::<IpAddr>()
        .map(canonical)
        .map_err(|_| ValidationError::InvalidAddress(input.to_string()))
}

/// Parse a CIDR rule. A bare address is treated as a host route. Networks
/// inside `::ffff:0:0/96` are rewritten to the IPv4 network they map.
pub fn parse_cidr(input: &str) -> Result<IpNet, ValidationError> {
    let trimmed = input.trim();
    if trimmed.contains('/') {
        return trimmed
            .parse::<IpNet>()
            .map(|net| canonical_net(net.trunc()))
            .map_err(|e| ValidationError::InvalidCidr {
                cidr: input.to_string(),
                reason: e.to_string(),
            });
    }

    let addr = parse_addr(trimmed).map_err(|_| ValidationError::InvalidCidr {
        cidr: input.to_string(),
        reason: "not an address or network".to_string(),
    })?;
    Ok(IpNet::from(addr))
}

/// CIDR membership test. IPv4-mapped IPv6 addresses are compared as IPv4.
pub fn cidr_contains(net: &IpNet, addr: IpAddr) -> bool {
    let addr = canonical(addr);
    match (net, addr) {
        (IpNet::V4(net), IpAddr::V4(v4)) => net.contains(&v4),
        (IpNet::V6(net), IpAddr::V6(v6)) => net.contains(&v6),
        // Mixed families never match
        _ => false,
    }
}

/// Classify an address as loopback, private, link-local or public
pub fn classify(addr: IpAddr) -> AddressClass {
    match canonical(addr) {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

/// Loopback, private or link-local
pub fn is_local_network(addr: IpAddr) -> bool {
    classify(addr).is_local()
}

fn classify_v4(addr: Ipv4Addr) -> AddressClass {
    if addr.is_loopback() {
        AddressClass::Loopback
    } else if addr.is_link_local() {
        AddressClass::LinkLocal
    } else if addr.is_private() || is_cgnat(addr) {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn classify_v6(addr: Ipv6Addr) -> AddressClass {
    let first = addr.segments()[0];
    if addr.is_loopback() {
        AddressClass::Loopback
    } else if first & 0xffc0 == 0xfe80 {
        AddressClass::LinkLocal
    } else if first & 0xfe00 == 0xfc00 {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

/// 100.64.0.0/10
fn is_cgnat(addr: Ipv4Addr) -> bool {
    u32::from(addr) & 0xffc0_0000 == 0x6440_0000
}

/// Unwrap IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4
fn canonical_net(net: IpNet) -> IpNet {
    match net {
        IpNet::V6(v6) if v6.prefix_len() >= 96 => v6
            .network()
            .to_ipv4_mapped()
            .and_then(|v4| Ipv4Net::new(v4, v6.prefix_len() - 96).ok())
            .map_or(net, IpNet::V4),
        _ => net,
    }
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
