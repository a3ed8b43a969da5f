//! Thin, testable facade over kernel link/route/addr/neigh/FDB/rule
//! operations. Every mutating call here is idempotent from the caller's
//! perspective: attempting to add something that already exists, or delete
//! something that is already gone, is success — not an error. That
//! idempotence is what lets the reconciler and the keepalive loop share
//! kernel state without a lock (see SPEC_FULL.md §5).

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(feature = "test-support")]
pub mod fake;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use crate::types::Family;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mac: [u8; 6],
    pub up: bool,
}

/// Parameters for creating or matching a VXLAN link. Two links are
/// considered to have the same *immutable* identity when `vni`, `port`, and
/// `parent_ifindex` all match; any other difference (MAC, up/down) is
/// updated in place by `EnsureLink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLinkParams {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub mac: [u8; 6],
    pub parent_ifindex: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerAddr {
    pub family: Family,
    pub v4: Option<(Ipv4Addr, u8)>,
    pub v6: Option<(Ipv6Addr, u8)>,
}

/// One neighbor (ARP/NDP) or FDB entry attached to a link. FDB entries are
/// distinguished from ordinary neighbor entries by `is_fdb` (bridge family,
/// mapping a MAC to the underlay parent IP); ordinary entries map an inner
/// tunnel IP to a MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighEntry {
    pub ifindex: u32,
    pub is_fdb: bool,
    pub ip: Option<IpAddr>,
    pub mac: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteNextHop {
    pub via: IpAddr,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParams {
    pub table: u32,
    pub family: Family,
    pub oif: u32,
    /// Empty => single-path default route via `oif`. Non-empty => multipath
    /// default route with one next-hop per entry, all via `oif`.
    pub multipath: Vec<RouteNextHop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleParams {
    pub family: Family,
    pub fw_mark: u32,
    pub fw_mask: u32,
    pub table: u32,
}

/// The injectable kernel boundary. Production code binds this to the host
/// kernel via rtnetlink (`linux::LinuxNetlink`); tests bind it to an
/// in-memory model that enforces the same idempotence semantics
/// (`fake::FakeNetlink`).
#[async_trait]
pub trait NetlinkPort: Send + Sync {
    async fn link_by_name(&self, name: &str) -> anyhow::Result<Option<LinkInfo>>;
    async fn link_by_index(&self, index: u32) -> anyhow::Result<Option<LinkInfo>>;

    /// Create a VXLAN link with the given parameters. Idempotent: if a link
    /// with this name already exists, it is left in place (the caller is
    /// responsible for deciding whether to recreate it).
    async fn vxlan_link_add(&self, params: &VxlanLinkParams) -> anyhow::Result<u32>;
    async fn link_del(&self, index: u32) -> anyhow::Result<()>;
    async fn link_set_up(&self, index: u32) -> anyhow::Result<()>;
    async fn link_set_mac(&self, index: u32, mac: [u8; 6]) -> anyhow::Result<()>;
    async fn link_set_offload(&self, index: u32, disable: bool) -> anyhow::Result<()>;

    async fn addr_list(&self, index: u32) -> anyhow::Result<Vec<InnerAddr>>;
    async fn addr_add(&self, index: u32, addr: &InnerAddr) -> anyhow::Result<()>;
    async fn addr_del(&self, index: u32, addr: &InnerAddr) -> anyhow::Result<()>;

    async fn neigh_list(&self, index: u32) -> anyhow::Result<Vec<NeighEntry>>;
    async fn neigh_add(&self, entry: &NeighEntry) -> anyhow::Result<()>;
    async fn neigh_del(&self, entry: &NeighEntry) -> anyhow::Result<()>;

    async fn rule_add(&self, rule: &RuleParams) -> anyhow::Result<()>;
    async fn rule_del(&self, rule: &RuleParams) -> anyhow::Result<()>;

    async fn route_list(&self, table: u32, family: Family) -> anyhow::Result<Vec<RouteParams>>;
    async fn route_add(&self, route: &RouteParams) -> anyhow::Result<()>;
    async fn route_del(&self, table: u32, family: Family) -> anyhow::Result<()>;

    /// Enumerate routes with destination `0.0.0.0/0` / `::/0`, used by the
    /// default-route parent-link resolution strategy.
    async fn default_routes(&self, family: Family) -> anyhow::Result<Vec<DefaultRoute>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    pub oif: u32,
    pub metric: u32,
}
