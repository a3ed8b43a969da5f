use clap::Parser;

use crate::types::Family;

/// Fixed firewall mark / mask used by the installed policy-routing rule.
/// Not configurable by design — see EXTERNAL INTERFACES in SPEC_FULL.md.
pub const FW_MARK: u32 = 0x1100_0000;
pub const FW_MASK: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMethod {
    ActiveStandby,
    ActiveActive,
}

impl ForwardMethod {
    pub fn is_multipath(self) -> bool {
        matches!(self, ForwardMethod::ActiveActive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelDetectMethod {
    DefaultRouteInterface,
    Interface(String),
}

impl TunnelDetectMethod {
    pub fn parse(raw: &str) -> Self {
        const PREFIX: &str = "interface=";
        if let Some(name) = raw.strip_prefix(PREFIX) {
            TunnelDetectMethod::Interface(name.to_string())
        } else {
            TunnelDetectMethod::DefaultRouteInterface
        }
    }
}

#[derive(Debug, Clone)]
pub struct VxlanConfig {
    pub name: String,
    pub id: u32,
    pub port: u16,
    pub disable_checksum_offload: bool,
}

/// Runtime configuration for the agent. Configuration *file* parsing is out
/// of scope per the spec; every option here is surfaced as a CLI flag and
/// assembled into this struct once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub vxlan: VxlanConfig,
    pub tunnel_ipv4_mask: u8,
    pub tunnel_ipv6_mask: u8,
    pub tunnel_detect_method: TunnelDetectMethod,
    pub forward_method: ForwardMethod,
    pub start_route_table: u32,
    pub control_plane: String,
    pub poll_interval_secs: u64,
}

impl Config {
    /// Which family to use for parent-interface resolution and the local
    /// node's own status writeback. IPv4 unless only IPv6 is enabled.
    pub fn active_family(&self) -> Family {
        if !self.enable_ipv4 && self.enable_ipv6 {
            Family::V6
        } else {
            Family::V4
        }
    }

    pub fn enabled_families(&self) -> Vec<Family> {
        let mut families = Vec::with_capacity(2);
        if self.enable_ipv4 {
            families.push(Family::V4);
        }
        if self.enable_ipv6 {
            families.push(Family::V6);
        }
        families
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            anyhow::bail!("at least one of enableIPv4/enableIPv6 must be true");
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "egress-mesh-agent")]
#[command(about = "Per-node egress overlay mesh agent", long_about = None)]
pub struct Args {
    /// Identity of the local node. Defaults to the system hostname.
    #[arg(long)]
    pub node_name: Option<String>,

    #[arg(long, default_value_t = true)]
    pub enable_ipv4: bool,

    #[arg(long, default_value_t = false)]
    pub enable_ipv6: bool,

    #[arg(long, default_value = "vxlan100")]
    pub vxlan_name: String,

    #[arg(long, default_value_t = 100)]
    pub vxlan_id: u32,

    #[arg(long, default_value_t = 4789)]
    pub vxlan_port: u16,

    #[arg(long, default_value_t = false)]
    pub disable_checksum_offload: bool,

    #[arg(long, default_value_t = 24)]
    pub tunnel_ipv4_mask: u8,

    #[arg(long, default_value_t = 64)]
    pub tunnel_ipv6_mask: u8,

    /// Either `defaultRouteInterface` or `interface=<name>`.
    #[arg(long, default_value = "defaultRouteInterface")]
    pub tunnel_detect_method: String,

    /// Either `activeStandby` or `activeActive`.
    #[arg(long, default_value = "activeStandby")]
    pub forward_method: String,

    #[arg(long, default_value_t = 500)]
    pub start_route_table: u32,

    /// Base URL of the cluster API this agent polls for EgressGateway and
    /// EgressNode objects.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub control_plane: String,

    #[arg(long, default_value_t = 5)]
    pub poll_interval_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn into_config(self, detected_hostname: String) -> anyhow::Result<Config> {
        let forward_method = match self.forward_method.as_str() {
            "activeActive" => ForwardMethod::ActiveActive,
            "activeStandby" => ForwardMethod::ActiveStandby,
            other => anyhow::bail!("unknown forwardMethod: {other}"),
        };

        let config = Config {
            node_name: self.node_name.unwrap_or(detected_hostname),
            enable_ipv4: self.enable_ipv4,
            enable_ipv6: self.enable_ipv6,
            vxlan: VxlanConfig {
                name: self.vxlan_name,
                id: self.vxlan_id,
                port: self.vxlan_port,
                disable_checksum_offload: self.disable_checksum_offload,
            },
            tunnel_ipv4_mask: self.tunnel_ipv4_mask,
            tunnel_ipv6_mask: self.tunnel_ipv6_mask,
            tunnel_detect_method: TunnelDetectMethod::parse(&self.tunnel_detect_method),
            forward_method,
            start_route_table: self.start_route_table,
            control_plane: self.control_plane,
            poll_interval_secs: self.poll_interval_secs,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_family_is_v4_by_default() {
        let cfg = test_config(true, false);
        assert_eq!(cfg.active_family(), Family::V4);
    }

    #[test]
    fn active_family_is_v6_when_only_v6_enabled() {
        let cfg = test_config(false, true);
        assert_eq!(cfg.active_family(), Family::V6);
    }

    #[test]
    fn active_family_is_v4_in_dual_stack() {
        let cfg = test_config(true, true);
        assert_eq!(cfg.active_family(), Family::V4);
    }

    #[test]
    fn validate_rejects_no_family() {
        let cfg = test_config(false, false);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tunnel_detect_method_parses_interface_prefix() {
        assert_eq!(
            TunnelDetectMethod::parse("interface=eth0"),
            TunnelDetectMethod::Interface("eth0".to_string())
        );
        assert_eq!(
            TunnelDetectMethod::parse("defaultRouteInterface"),
            TunnelDetectMethod::DefaultRouteInterface
        );
    }

    fn test_config(v4: bool, v6: bool) -> Config {
        Config {
            node_name: "n1".to_string(),
            enable_ipv4: v4,
            enable_ipv6: v6,
            vxlan: VxlanConfig {
                name: "vxlan100".to_string(),
                id: 100,
                port: 4789,
                disable_checksum_offload: false,
            },
            tunnel_ipv4_mask: 24,
            tunnel_ipv6_mask: 64,
            tunnel_detect_method: TunnelDetectMethod::DefaultRouteInterface,
            forward_method: ForwardMethod::ActiveStandby,
            start_route_table: 500,
            control_plane: "http://127.0.0.1:8080".to_string(),
            poll_interval_secs: 5,
        }
    }
}
