//! Owns the local VXLAN device: creation, inner tunnel addresses, and the
//! per-peer FDB/neighbor entries that map a peer's tunnel MAC to both its
//! underlay parent IP (FDB) and its inner tunnel IP(s) (ordinary neighbor
//! entries).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::debug;

use crate::config::VxlanConfig;
use crate::netlink::{InnerAddr, NeighEntry, NetlinkPort, VxlanLinkParams};
use crate::types::{Family, Peer};

pub struct VxlanManager {
    netlink: Arc<dyn NetlinkPort>,
    config: VxlanConfig,
}

impl VxlanManager {
    pub fn new(netlink: Arc<dyn NetlinkPort>, config: VxlanConfig) -> Self {
        Self { netlink, config }
    }

    /// Create the VXLAN device if it doesn't exist, bring it up, apply the
    /// MAC and checksum-offload settings, and ensure the inner address set
    /// matches exactly `{inner_v4?, inner_v6?}` — any other address present
    /// on the link is removed, anything missing is added. Idempotent:
    /// calling this repeatedly with the same arguments converges rather
    /// than erring.
    pub async fn ensure_link(
        &self,
        parent_ifindex: u32,
        mac: [u8; 6],
        inner_v4: Option<(Ipv4Addr, u8)>,
        inner_v6: Option<(Ipv6Addr, u8)>,
    ) -> anyhow::Result<u32> {
        let params = VxlanLinkParams {
            name: self.config.name.clone(),
            vni: self.config.id,
            port: self.config.port,
            mac,
            parent_ifindex,
        };
        let ifindex = self.netlink.vxlan_link_add(&params).await?;
        self.netlink.link_set_mac(ifindex, mac).await?;
        self.netlink.link_set_up(ifindex).await?;
        if self.config.disable_checksum_offload {
            self.netlink.link_set_offload(ifindex, true).await?;
        }

        self.reconcile_addrs(ifindex, inner_v4, inner_v6).await?;

        debug!(name = %self.config.name, ifindex, "vxlan link ensured");
        Ok(ifindex)
    }

    async fn reconcile_addrs(
        &self,
        ifindex: u32,
        inner_v4: Option<(Ipv4Addr, u8)>,
        inner_v6: Option<(Ipv6Addr, u8)>,
    ) -> anyhow::Result<()> {
        let wanted: Vec<InnerAddr> = [
            inner_v4.map(|(ip, mask)| InnerAddr { family: Family::V4, v4: Some((ip, mask)), v6: None }),
            inner_v6.map(|(ip, mask)| InnerAddr { family: Family::V6, v4: None, v6: Some((ip, mask)) }),
        ]
        .into_iter()
        .flatten()
        .collect();

        let existing = self.netlink.addr_list(ifindex).await?;
        for addr in existing.iter().filter(|a| !wanted.contains(a)) {
            self.netlink.addr_del(ifindex, addr).await?;
        }
        for addr in wanted.iter().filter(|a| !existing.contains(a)) {
            self.netlink.addr_add(ifindex, addr).await?;
        }
        Ok(())
    }

    /// Installs both the FDB entry (underlay parent IP -> peer MAC) and the
    /// inner neighbor entry(ies) (peer's inner tunnel IP -> peer MAC) for
    /// every enabled family the peer has an inner address for.
    pub async fn add_peer(&self, ifindex: u32, peer: &Peer) -> anyhow::Result<()> {
        let fdb = NeighEntry { ifindex, is_fdb: true, ip: Some(peer.parent_ip), mac: peer.mac };
        self.netlink.neigh_add(&fdb).await?;
        for entry in inner_neigh_entries(ifindex, peer) {
            self.netlink.neigh_add(&entry).await?;
        }
        Ok(())
    }

    pub async fn del_peer(&self, ifindex: u32, peer: &Peer) -> anyhow::Result<()> {
        let fdb = NeighEntry { ifindex, is_fdb: true, ip: Some(peer.parent_ip), mac: peer.mac };
        self.netlink.neigh_del(&fdb).await?;
        for entry in inner_neigh_entries(ifindex, peer) {
            self.netlink.neigh_del(&entry).await?;
        }
        Ok(())
    }

    /// FDB entries currently installed on the VXLAN device, keyed by the
    /// underlay destination they point at.
    pub async fn list_fdb(&self, ifindex: u32) -> anyhow::Result<Vec<(IpAddr, [u8; 6])>> {
        let neighs = self.netlink.neigh_list(ifindex).await?;
        Ok(neighs
            .into_iter()
            .filter(|n| n.is_fdb)
            .filter_map(|n| n.ip.map(|ip| (ip, n.mac)))
            .collect())
    }

    /// Every FDB and inner-neighbor entry installed on the device, as
    /// `(is_fdb, ip, mac)` tuples. Used to diff the full installed set
    /// against the expected peer set, since a stale inner-neighbor entry is
    /// just as much a convergence bug as a stale FDB entry.
    pub async fn list_entries(&self, ifindex: u32) -> anyhow::Result<Vec<(bool, IpAddr, [u8; 6])>> {
        let neighs = self.netlink.neigh_list(ifindex).await?;
        Ok(neighs.into_iter().filter_map(|n| n.ip.map(|ip| (n.is_fdb, ip, n.mac))).collect())
    }
}

fn inner_neigh_entries(ifindex: u32, peer: &Peer) -> Vec<NeighEntry> {
    let mut entries = Vec::with_capacity(2);
    if let Some(ip) = peer.inner_v4 {
        entries.push(NeighEntry { ifindex, is_fdb: false, ip: Some(IpAddr::V4(ip)), mac: peer.mac });
    }
    if let Some(ip) = peer.inner_v6 {
        entries.push(NeighEntry { ifindex, is_fdb: false, ip: Some(IpAddr::V6(ip)), mac: peer.mac });
    }
    entries
}
