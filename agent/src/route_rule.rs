//! Installs the policy-routing rule and default route that steer
//! fwmark-tagged egress traffic into the VXLAN overlay.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ForwardMethod, FW_MARK, FW_MASK};
use crate::netlink::{NetlinkPort, RouteNextHop, RouteParams, RuleParams};
use crate::types::Family;

pub struct RuleRouteInstaller {
    netlink: Arc<dyn NetlinkPort>,
    start_route_table: u32,
    forward_method: ForwardMethod,
}

impl RuleRouteInstaller {
    pub fn new(netlink: Arc<dyn NetlinkPort>, start_route_table: u32, forward_method: ForwardMethod) -> Self {
        Self { netlink, start_route_table, forward_method }
    }

    fn table_for(&self, family: Family) -> u32 {
        self.start_route_table + family.table_offset()
    }

    /// Ensure the fwmark rule exists for `family`, and that the default
    /// route reflects `peer_ips` exactly. Empty peer lists collapse the
    /// route (remove it) while leaving the rule in place — true in both
    /// single-path and multipath mode. Called once per enabled family,
    /// every reconcile and every keepalive tick — must be a no-op when
    /// nothing has changed.
    pub async fn ensure(
        &self,
        family: Family,
        vxlan_ifindex: u32,
        peer_ips: &[IpAddr],
    ) -> anyhow::Result<()> {
        let table = self.table_for(family);

        self.netlink
            .rule_add(&RuleParams { family, fw_mark: FW_MARK, fw_mask: FW_MASK, table })
            .await?;

        if peer_ips.is_empty() {
            self.netlink.route_del(table, family).await?;
            debug!(?family, table, "no peers, route removed");
            return Ok(());
        }

        let multipath = if self.forward_method.is_multipath() {
            peer_ips.iter().map(|via| RouteNextHop { via: *via, weight: 1 }).collect()
        } else {
            Vec::new()
        };

        self.netlink
            .route_add(&RouteParams { table, family, oif: vxlan_ifindex, multipath })
            .await?;

        debug!(?family, table, peers = peer_ips.len(), "rule/route ensured");
        Ok(())
    }
}
