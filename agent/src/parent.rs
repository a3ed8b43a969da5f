//! Resolves which physical interface carries the underlay (parent) traffic
//! for the VXLAN device, per the configured `TunnelDetectMethod`.

use std::sync::Arc;

use crate::config::TunnelDetectMethod;
use crate::netlink::{LinkInfo, NetlinkPort};
use crate::types::Family;

#[derive(Debug, Clone)]
pub struct ParentLink {
    pub name: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
}

pub struct ParentResolver {
    netlink: Arc<dyn NetlinkPort>,
}

impl ParentResolver {
    pub fn new(netlink: Arc<dyn NetlinkPort>) -> Self {
        Self { netlink }
    }

    pub async fn resolve(
        &self,
        method: &TunnelDetectMethod,
        family: Family,
    ) -> anyhow::Result<ParentLink> {
        match method {
            TunnelDetectMethod::Interface(name) => self.resolve_by_name(name, family).await,
            TunnelDetectMethod::DefaultRouteInterface => {
                self.resolve_by_default_route(family).await
            }
        }
    }

    async fn resolve_by_name(&self, name: &str, family: Family) -> anyhow::Result<ParentLink> {
        let link = self
            .netlink
            .link_by_name(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tunnel interface {name} does not exist"))?;

        let addrs = self.netlink.addr_list(link.index).await?;
        let has_family_addr = match family {
            Family::V4 => addrs.iter().any(|a| a.v4.is_some()),
            Family::V6 => addrs.iter().any(|a| a.v6.is_some()),
        };
        if !has_family_addr {
            anyhow::bail!("tunnel interface {name} has no address in {family:?}");
        }

        Ok(to_parent_link(link))
    }

    async fn resolve_by_default_route(&self, family: Family) -> anyhow::Result<ParentLink> {
        let mut routes = self.netlink.default_routes(family).await?;
        routes.sort_by_key(|r| r.metric);
        let route = routes
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no default route found for {family:?}"))?;
        let link = self
            .netlink
            .link_by_index(route.oif)
            .await?
            .ok_or_else(|| anyhow::anyhow!("default route output interface {} vanished", route.oif))?;
        Ok(to_parent_link(link))
    }
}

fn to_parent_link(link: LinkInfo) -> ParentLink {
    ParentLink { name: link.name, ifindex: link.index, mac: link.mac }
}
