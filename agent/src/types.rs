use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// IPv4, IPv6, or both — whichever families the operator enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Routing-table offset added to `startRouteTable` for this family.
    pub fn table_offset(self) -> u32 {
        match self {
            Family::V4 => 0,
            Family::V6 => 1,
        }
    }
}

// ============================================================================
// Cluster objects (EgressGateway, EgressNode)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayNodeEntry {
    pub name: String,
    pub ready: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayObject {
    pub name: String,
    #[serde(default)]
    pub node_list: Vec<GatewayNodeEntry>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodePhase {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub physical_interface: String,
    #[serde(default)]
    pub physical_interface_ipv4: String,
    #[serde(default)]
    pub physical_interface_ipv6: String,
    #[serde(default)]
    pub vxlan_ipv4: String,
    #[serde(default)]
    pub vxlan_ipv6: String,
    #[serde(default)]
    pub tunnel_mac: String,
    #[serde(default)]
    pub phase: NodePhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeObject {
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub deleted: bool,
}

// ============================================================================
// In-memory peer representation
// ============================================================================

/// One overlay endpoint: the underlay address that carries the VXLAN
/// encapsulation, the inner tunnel addresses, and the MAC the peer's VXLAN
/// device answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub parent_ip: IpAddr,
    pub mac: [u8; 6],
    pub inner_v4: Option<Ipv4Addr>,
    pub inner_v6: Option<Ipv6Addr>,
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roundtrip() {
        let mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
        let s = format_mac(mac);
        assert_eq!(s, "02:00:00:00:00:01");
        assert_eq!(parse_mac(&s), Some(mac));
    }

    #[test]
    fn mac_rejects_garbage() {
        assert_eq!(parse_mac("not-a-mac"), None);
        assert_eq!(parse_mac("02:00:00:00:00"), None);
    }
}
