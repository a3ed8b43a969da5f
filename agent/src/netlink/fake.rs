//! In-memory stand-in for the kernel, used by unit tests and the
//! integration-tests workspace member. Enforces the same idempotence
//! contract as `linux::LinuxNetlink` so tests exercise real reconciler
//! behavior rather than a looser double.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::Family;

use super::{
    DefaultRoute, InnerAddr, LinkInfo, NeighEntry, NetlinkPort, RouteParams, RuleParams,
    VxlanLinkParams,
};

#[derive(Debug, Default)]
struct State {
    next_index: u32,
    links: HashMap<u32, LinkInfo>,
    links_by_name: HashMap<String, u32>,
    addrs: HashMap<u32, Vec<InnerAddr>>,
    neighs: HashMap<u32, Vec<NeighEntry>>,
    rules: Vec<RuleParams>,
    routes: Vec<RouteParams>,
    default_routes: HashMap<Family, Vec<DefaultRoute>>,
}

/// Fake kernel. Construct with [`FakeNetlink::new`], seed a parent link and
/// default route with [`FakeNetlink::seed_parent_link`], then hand a shared
/// clone to the component under test.
pub struct FakeNetlink {
    state: Mutex<State>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Test helper: register a pre-existing parent link (e.g. `eth0`) with a
    /// given index and, optionally, a default route out of it. Mirrors what
    /// a real host looks like before the agent starts.
    pub fn seed_parent_link(&self, name: &str, mac: [u8; 6], family: Family, metric: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        let index = state.next_index + 1;
        state.next_index = index;
        state.links.insert(index, LinkInfo { index, name: name.to_string(), mac, up: true });
        state.links_by_name.insert(name.to_string(), index);
        state
            .default_routes
            .entry(family)
            .or_default()
            .push(DefaultRoute { oif: index, metric });
        index
    }

    pub fn neigh_count(&self, ifindex: u32) -> usize {
        self.state.lock().unwrap().neighs.get(&ifindex).map(|v| v.len()).unwrap_or(0)
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().unwrap().rules.len()
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().unwrap().routes.len()
    }
}

impl Default for FakeNetlink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetlinkPort for FakeNetlink {
    async fn link_by_name(&self, name: &str) -> anyhow::Result<Option<LinkInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state.links_by_name.get(name).and_then(|i| state.links.get(i)).cloned())
    }

    async fn link_by_index(&self, index: u32) -> anyhow::Result<Option<LinkInfo>> {
        Ok(self.state.lock().unwrap().links.get(&index).cloned())
    }

    async fn vxlan_link_add(&self, params: &VxlanLinkParams) -> anyhow::Result<u32> {
        let mut state = self.state.lock().unwrap();
        if let Some(&index) = state.links_by_name.get(&params.name) {
            return Ok(index);
        }
        let index = state.next_index + 1;
        state.next_index = index;
        state.links.insert(
            index,
            LinkInfo { index, name: params.name.clone(), mac: params.mac, up: false },
        );
        state.links_by_name.insert(params.name.clone(), index);
        Ok(index)
    }

    async fn link_del(&self, index: u32) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.links.remove(&index) {
            state.links_by_name.remove(&link.name);
        }
        Ok(())
    }

    async fn link_set_up(&self, index: u32) -> anyhow::Result<()> {
        if let Some(link) = self.state.lock().unwrap().links.get_mut(&index) {
            link.up = true;
        }
        Ok(())
    }

    async fn link_set_mac(&self, index: u32, mac: [u8; 6]) -> anyhow::Result<()> {
        if let Some(link) = self.state.lock().unwrap().links.get_mut(&index) {
            link.mac = mac;
        }
        Ok(())
    }

    async fn link_set_offload(&self, _index: u32, _disable: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn addr_list(&self, index: u32) -> anyhow::Result<Vec<InnerAddr>> {
        Ok(self.state.lock().unwrap().addrs.get(&index).cloned().unwrap_or_default())
    }

    async fn addr_add(&self, index: u32, addr: &InnerAddr) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let list = state.addrs.entry(index).or_default();
        if !list.contains(addr) {
            list.push(*addr);
        }
        Ok(())
    }

    async fn addr_del(&self, index: u32, addr: &InnerAddr) -> anyhow::Result<()> {
        if let Some(list) = self.state.lock().unwrap().addrs.get_mut(&index) {
            list.retain(|a| a != addr);
        }
        Ok(())
    }

    async fn neigh_list(&self, index: u32) -> anyhow::Result<Vec<NeighEntry>> {
        Ok(self.state.lock().unwrap().neighs.get(&index).cloned().unwrap_or_default())
    }

    async fn neigh_add(&self, entry: &NeighEntry) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let list = state.neighs.entry(entry.ifindex).or_default();
        if let Some(existing) = list.iter_mut().find(|e| e.ip == entry.ip && e.is_fdb == entry.is_fdb) {
            existing.mac = entry.mac;
        } else {
            list.push(entry.clone());
        }
        Ok(())
    }

    async fn neigh_del(&self, entry: &NeighEntry) -> anyhow::Result<()> {
        if let Some(list) = self.state.lock().unwrap().neighs.get_mut(&entry.ifindex) {
            list.retain(|e| !(e.ip == entry.ip && e.is_fdb == entry.is_fdb));
        }
        Ok(())
    }

    async fn rule_add(&self, rule: &RuleParams) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.rules.contains(rule) {
            state.rules.push(rule.clone());
        }
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleParams) -> anyhow::Result<()> {
        self.state.lock().unwrap().rules.retain(|r| r != rule);
        Ok(())
    }

    async fn route_list(&self, table: u32, family: Family) -> anyhow::Result<Vec<RouteParams>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| r.table == table && r.family == family)
            .cloned()
            .collect())
    }

    async fn route_add(&self, route: &RouteParams) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.routes.retain(|r| !(r.table == route.table && r.family == route.family));
        state.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, table: u32, family: Family) -> anyhow::Result<()> {
        self.state.lock().unwrap().routes.retain(|r| !(r.table == table && r.family == family));
        Ok(())
    }

    async fn default_routes(&self, family: Family) -> anyhow::Result<Vec<DefaultRoute>> {
        Ok(self.state.lock().unwrap().default_routes.get(&family).cloned().unwrap_or_default())
    }
}

#[allow(dead_code)]
fn loopback_v4() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
