//! Address normalization and the LAN heuristics used for presence grouping
//! and the `connectionType` hint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::HeaderMap;

use crate::protocol::ConnectionType;

const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// RFC 1918.
    Private,
    /// Carrier-grade NAT, 100.64.0.0/10.
    Cgnat,
    Public,
}

/// Render an address the way the registry stores it: IPv4-mapped IPv6 and
/// the IPv6 loopback collapse to dotted IPv4.
pub fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) if v6.is_loopback() => Ipv4Addr::LOCALHOST.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

/// Address of the remote client. Behind a reverse proxy the first
/// `X-Forwarded-For` hop names the client; otherwise the socket peer does.
pub fn source_address(peer: SocketAddr, headers: &HeaderMap, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return normalize_ip(ip);
        }
    }
    normalize_ip(peer.ip())
}

pub fn classify(addr: &str) -> AddressClass {
    match addr.parse::<Ipv4Addr>() {
        Ok(v4) if v4.is_private() => AddressClass::Private,
        Ok(v4) if is_cgnat(v4) => AddressClass::Cgnat,
        _ => AddressClass::Public,
    }
}

fn is_cgnat(addr: Ipv4Addr) -> bool {
    let [a, b, ..] = addr.octets();
    a == 100 && (64..128).contains(&b)
}

fn prefix24(addr: &str) -> Option<String> {
    let v4 = addr.parse::<Ipv4Addr>().ok()?;
    let [a, b, c, _] = v4.octets();
    Some(format!("{a}.{b}.{c}"))
}

/// Key under which clients are considered to share a network.
pub fn group_key(addr: &str) -> String {
    match classify(addr) {
        AddressClass::Private => prefix24(addr).unwrap_or_else(|| addr.to_string()),
        AddressClass::Cgnat | AddressClass::Public => addr.to_string(),
    }
}

pub fn connection_type(a: &str, b: &str) -> ConnectionType {
    if a == b {
        return ConnectionType::Local;
    }
    let both_private =
        classify(a) == AddressClass::Private && classify(b) == AddressClass::Private;
    if both_private && prefix24(a) == prefix24(b) {
        ConnectionType::Local
    } else {
        ConnectionType::Remote
    }
}
