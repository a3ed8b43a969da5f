//! Converges the local VXLAN device, peer FDB/neighbor state, and the
//! gateway-driven policy route against the cluster's view of
//! `EgressGateway`/`EgressNode` objects. One `Reconciler` instance is shared
//! by the polling-driven event loop and the keepalive loop; both call
//! `reconcile` — the keepalive loop just does it on a timer instead of in
//! response to an event, using the self node's own name.
//!
//! Two independent pieces of state converge here, fed by two different
//! object kinds, the way the upstream controller this agent descends from
//! keeps them independent:
//! - FDB/neighbor entries for every known peer (`EgressNode` events, plus
//!   the keepalive tick) — lets this node receive overlay traffic from any
//!   peer it has ever heard of.
//! - The fwmark policy route (`EgressGateway` events) — only steers traffic
//!   at the subset of peers the gateway object currently designates
//!   ready-and-active as the egress point for a group.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::cluster::{ClusterClient, ObjectKind, ReconcileRequest};
use crate::config::Config;
use crate::error::ReconcileError;
use crate::netlink::{NeighEntry, NetlinkPort};
use crate::parent::{ParentLink, ParentResolver};
use crate::registry::PeerRegistry;
use crate::route_rule::RuleRouteInstaller;
use crate::types::{Family, NodeObject, NodePhase, NodeStatus, Peer};
use crate::vxlan::VxlanManager;

pub struct Reconciler {
    config: Config,
    cluster: Arc<dyn ClusterClient>,
    netlink: Arc<dyn NetlinkPort>,
    parent: ParentResolver,
    vxlan: VxlanManager,
    route_rule: RuleRouteInstaller,
    registry: PeerRegistry,
    /// Set once the local node has been reconciled at least once. FDB/route
    /// work before this point is requeued rather than attempted, since
    /// there is no local VXLAN device to attach entries to yet.
    vxlan_ifindex: Mutex<Option<u32>>,
    /// Per-family inner tunnel IPs of the nodes the most recently seen
    /// `EgressGateway` object designates ready-and-active, keyed by family.
    /// This is what `route_rule.ensure` is actually fed from — not the full
    /// peer registry.
    gateway_peer_ips: Mutex<HashMap<Family, Vec<IpAddr>>>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        cluster: Arc<dyn ClusterClient>,
        netlink: Arc<dyn NetlinkPort>,
    ) -> Self {
        let parent = ParentResolver::new(netlink.clone());
        let vxlan = VxlanManager::new(netlink.clone(), config.vxlan.clone());
        let route_rule = RuleRouteInstaller::new(netlink.clone(), config.start_route_table, config.forward_method);
        Self {
            config,
            cluster,
            netlink,
            parent,
            vxlan,
            route_rule,
            registry: PeerRegistry::new(),
            vxlan_ifindex: Mutex::new(None),
            gateway_peer_ips: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<(), ReconcileError> {
        match request.kind {
            ObjectKind::Gateway => self.reconcile_gateway(&request.name).await,
            ObjectKind::Node => self.reconcile_node(&request.name, request.deleted).await,
        }
    }

    /// `EgressGateway` objects track which nodes are currently
    /// ready-and-active egress points for a group of workloads. The policy
    /// route is rebuilt from exactly that set's inner tunnel IPs. When the
    /// local node is itself one of those active nodes, the cached set is
    /// cleared instead of populated — traffic doesn't need to traverse the
    /// overlay to reach a gateway this node already is. On delete (or when
    /// the object can't be found), the cache is cleared the same way, which
    /// retracts the route via `route_rule.ensure`'s empty-list handling —
    /// the rule itself is left installed either way.
    async fn reconcile_gateway(&self, name: &str) -> Result<(), ReconcileError> {
        let gateway = self
            .cluster
            .get_gateway(name)
            .await
            .map_err(ReconcileError::requeue)?;

        let gateway = match gateway {
            Some(g) if !g.deleted => g,
            _ => {
                self.set_gateway_cache(HashMap::new());
                return self.apply_gateway_cache().await;
            }
        };

        let self_is_active_gateway = gateway
            .node_list
            .iter()
            .any(|n| n.name == self.config.node_name && n.active);

        let mut cache: HashMap<Family, Vec<IpAddr>> = HashMap::new();
        if self_is_active_gateway {
            info!(gateway = %name, "local node is active egress gateway, clearing cached route peers");
        } else {
            for entry in gateway.node_list.iter().filter(|n| n.ready && n.active) {
                let node = match self.cluster.get_node(&entry.name).await.map_err(ReconcileError::requeue)? {
                    Some(n) => n,
                    None => continue,
                };
                for family in self.config.enabled_families() {
                    let raw = match family {
                        Family::V4 => &node.status.vxlan_ipv4,
                        Family::V6 => &node.status.vxlan_ipv6,
                    };
                    if raw.is_empty() {
                        continue;
                    }
                    match raw.parse::<IpAddr>() {
                        Ok(ip) => cache.entry(family).or_default().push(ip),
                        Err(_) => warn!(node = %entry.name, family = ?family, "invalid vxlan IP in gateway node list, skipping"),
                    }
                }
            }
        }

        self.set_gateway_cache(cache);
        self.apply_gateway_cache().await
    }

    fn set_gateway_cache(&self, cache: HashMap<Family, Vec<IpAddr>>) {
        *self.gateway_peer_ips.lock().unwrap() = cache;
    }

    /// Pushes the current gateway-peer cache into `route_rule.ensure`. A
    /// no-op until the local VXLAN device exists, since there is no output
    /// interface to route through yet; the cache is re-applied once it does
    /// (see `reconcile_self`).
    async fn apply_gateway_cache(&self) -> Result<(), ReconcileError> {
        let ifindex = match *self.vxlan_ifindex.lock().unwrap() {
            Some(i) => i,
            None => return Ok(()),
        };
        let cache = self.gateway_peer_ips.lock().unwrap().clone();
        for family in self.config.enabled_families() {
            let peer_ips = cache.get(&family).cloned().unwrap_or_default();
            self.route_rule
                .ensure(family, ifindex, &peer_ips)
                .await
                .map_err(ReconcileError::requeue)?;
        }
        Ok(())
    }

    async fn reconcile_node(&self, name: &str, deleted: bool) -> Result<(), ReconcileError> {
        if deleted {
            return self.reconcile_node_deleted(name).await;
        }

        let node = self
            .cluster
            .get_node(name)
            .await
            .map_err(ReconcileError::requeue)?;
        let node = match node {
            Some(n) if !n.deleted => n,
            _ => return self.reconcile_node_deleted(name).await,
        };

        if name == self.config.node_name {
            self.reconcile_self(&node).await
        } else {
            self.reconcile_peer(&node).await
        }
    }

    async fn reconcile_node_deleted(&self, name: &str) -> Result<(), ReconcileError> {
        if name == self.config.node_name {
            return Ok(());
        }
        if self.registry.delete(name).is_some() {
            info!(node = %name, "peer removed, garbage collecting overlay state");
            self.sync_overlay_state().await?;
        }
        Ok(())
    }

    async fn reconcile_self(&self, node: &NodeObject) -> Result<(), ReconcileError> {
        let active_family = self.config.active_family();
        let enabled = self.config.enabled_families();

        let parent = self
            .parent
            .resolve(&self.config.tunnel_detect_method, active_family)
            .await
            .map_err(ReconcileError::fatal)?;

        // tunnel_mac/vxlan_ipv4/vxlan_ipv6 are assigned to this node by an
        // external allocator (out of scope here) and only ever read — never
        // synthesized from the parent link.
        let (mac, inner_v4, inner_v6) = parse_local_identity(&node.status, &enabled)
            .map_err(ReconcileError::requeue)?;

        let ifindex = self
            .vxlan
            .ensure_link(
                parent.ifindex,
                mac,
                inner_v4.map(|ip| (ip, self.config.tunnel_ipv4_mask)),
                inner_v6.map(|ip| (ip, self.config.tunnel_ipv6_mask)),
            )
            .await
            .map_err(ReconcileError::requeue)?;
        *self.vxlan_ifindex.lock().unwrap() = Some(ifindex);

        let mut status = self
            .build_local_status(node.status.clone(), &parent, &enabled)
            .await
            .map_err(ReconcileError::requeue)?;
        status.phase = match parse_vtep(&status, &enabled, active_family) {
            Ok(_) => NodePhase::Succeeded,
            Err(_) => NodePhase::Pending,
        };
        self.cluster
            .patch_node_status(&node.name, &status)
            .await
            .map_err(ReconcileError::requeue)?;

        if let Ok(local_peer) = parse_vtep(&status, &enabled, active_family) {
            self.registry.store(&node.name, local_peer);
        }

        self.sync_overlay_state().await?;
        self.apply_gateway_cache().await
    }

    /// Patches `physical_interface`/`physical_interface_ipv4`/
    /// `physical_interface_ipv6`/`phase` onto a copy of the node's existing
    /// status, clearing the inactive family's physical-interface field.
    /// `vxlan_ipv4`/`vxlan_ipv6`/`tunnel_mac` pass through untouched — this
    /// agent never writes them.
    async fn build_local_status(
        &self,
        mut status: NodeStatus,
        parent: &ParentLink,
        enabled: &[Family],
    ) -> anyhow::Result<NodeStatus> {
        status.physical_interface = parent.name.clone();

        let parent_addrs = self.netlink.addr_list(parent.ifindex).await?;
        if enabled.contains(&Family::V4) {
            if let Some((ip, _)) = parent_addrs.iter().find_map(|a| a.v4) {
                status.physical_interface_ipv4 = ip.to_string();
            }
        } else {
            status.physical_interface_ipv4 = String::new();
        }
        if enabled.contains(&Family::V6) {
            if let Some((ip, _)) = parent_addrs.iter().find_map(|a| a.v6) {
                status.physical_interface_ipv6 = ip.to_string();
            }
        } else {
            status.physical_interface_ipv6 = String::new();
        }

        Ok(status)
    }

    async fn reconcile_peer(&self, node: &NodeObject) -> Result<(), ReconcileError> {
        let peer = parse_vtep(&node.status, &self.config.enabled_families(), self.config.active_family())
            .map_err(ReconcileError::requeue)?;
        self.registry.store(&node.name, peer);
        self.sync_overlay_state().await
    }

    /// Rebuilds FDB and inner-tunnel neighbor entries from every peer in the
    /// registry except the local node. Mirrors the upstream controller's
    /// `ensureRoute`: compute the expected set, delete what shouldn't be
    /// there, add what should. Does not touch the policy route — that's
    /// `apply_gateway_cache`'s job, driven by `EgressGateway` events.
    async fn sync_overlay_state(&self) -> Result<(), ReconcileError> {
        let ifindex = match *self.vxlan_ifindex.lock().unwrap() {
            Some(i) => i,
            None => {
                return Err(ReconcileError::requeue(anyhow::anyhow!(
                    "local vxlan device not ready yet"
                )))
            }
        };

        let peer_names = self.registry.names_excluding(&self.config.node_name);
        let peers: Vec<(String, Peer)> = peer_names
            .into_iter()
            .filter_map(|name| self.registry.load(&name).map(|p| (name, p)))
            .collect();

        let existing = self.vxlan.list_entries(ifindex).await.map_err(ReconcileError::requeue)?;
        let mut expected: HashSet<(bool, IpAddr, [u8; 6])> = HashSet::new();
        for (_, peer) in &peers {
            expected.insert((true, peer.parent_ip, peer.mac));
            if let Some(ip) = peer.inner_v4 {
                expected.insert((false, IpAddr::V4(ip), peer.mac));
            }
            if let Some(ip) = peer.inner_v6 {
                expected.insert((false, IpAddr::V6(ip), peer.mac));
            }
        }

        for (is_fdb, ip, mac) in existing {
            if !expected.contains(&(is_fdb, ip, mac)) {
                let stale = NeighEntry { ifindex, is_fdb, ip: Some(ip), mac };
                if let Err(e) = self.netlink.neigh_del(&stale).await {
                    warn!(error = %e, "failed to remove stale neighbor entry");
                }
            }
        }

        for (_, peer) in &peers {
            self.vxlan.add_peer(ifindex, peer).await.map_err(ReconcileError::requeue)?;
        }

        Ok(())
    }
}

/// Reads the identity this node has been assigned by the cluster: the
/// tunnel MAC and, for every enabled family, the inner tunnel address.
/// Unlike `parse_vtep`, this does not require the parent/physical address —
/// that's what this node is in the middle of discovering.
fn parse_local_identity(
    status: &NodeStatus,
    enabled: &[Family],
) -> anyhow::Result<([u8; 6], Option<std::net::Ipv4Addr>, Option<std::net::Ipv6Addr>)> {
    let mac = crate::types::parse_mac(&status.tunnel_mac)
        .ok_or_else(|| anyhow::anyhow!("local node has no assigned tunnel MAC yet: {:?}", status.tunnel_mac))?;

    let mut inner_v4 = None;
    let mut inner_v6 = None;
    for family in enabled {
        match family {
            Family::V4 => {
                inner_v4 = Some(
                    status
                        .vxlan_ipv4
                        .parse()
                        .map_err(|_| anyhow::anyhow!("local node has no assigned vxlan ipv4 yet: {:?}", status.vxlan_ipv4))?,
                );
            }
            Family::V6 => {
                inner_v6 = Some(
                    status
                        .vxlan_ipv6
                        .parse()
                        .map_err(|_| anyhow::anyhow!("local node has no assigned vxlan ipv6 yet: {:?}", status.vxlan_ipv6))?,
                );
            }
        }
    }

    Ok((mac, inner_v4, inner_v6))
}

/// Extracts a [`Peer`] from a node's reported status, validating that every
/// enabled family has both a parent (underlay) address and an inner tunnel
/// address. `active_family` selects which address backs `parent_ip`, since
/// the underlay can only carry the tunnel over one family at a time.
fn parse_vtep(status: &NodeStatus, enabled: &[Family], active_family: Family) -> anyhow::Result<Peer> {
    let mac = crate::types::parse_mac(&status.tunnel_mac)
        .ok_or_else(|| anyhow::anyhow!("invalid or missing tunnel MAC: {:?}", status.tunnel_mac))?;

    let parent_ip_raw = match active_family {
        Family::V4 => &status.physical_interface_ipv4,
        Family::V6 => &status.physical_interface_ipv6,
    };
    let parent_ip: IpAddr = parent_ip_raw
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid parent IP for active family: {parent_ip_raw:?}"))?;

    let mut inner_v4 = None;
    let mut inner_v6 = None;
    for family in enabled {
        match family {
            Family::V4 => {
                inner_v4 = Some(
                    status
                        .vxlan_ipv4
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid vxlan ipv4: {:?}", status.vxlan_ipv4))?,
                );
            }
            Family::V6 => {
                inner_v6 = Some(
                    status
                        .vxlan_ipv6
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid vxlan ipv6: {:?}", status.vxlan_ipv6))?,
                );
            }
        }
    }

    Ok(Peer { parent_ip, mac, inner_v4, inner_v6 })
}
