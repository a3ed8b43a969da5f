//! End-to-end scenarios against an in-process fake kernel and fake cluster
//! API. These exercise the same reconcile path the binary drives, just
//! without a real host or control plane backing it.

use std::sync::Arc;
use std::time::Duration;

use egress_mesh_agent::cluster::fake::FakeClusterClient;
use egress_mesh_agent::cluster::{ObjectKind, ReconcileRequest};
use egress_mesh_agent::config::{Config, ForwardMethod, TunnelDetectMethod, VxlanConfig};
use egress_mesh_agent::netlink::fake::FakeNetlink;
use egress_mesh_agent::netlink::{InnerAddr, NetlinkPort};
use egress_mesh_agent::reconciler::Reconciler;
use egress_mesh_agent::types::{Family, GatewayNodeEntry, GatewayObject, NodeObject, NodeStatus};

fn base_config(node_name: &str, enable_ipv6: bool, forward_method: ForwardMethod) -> Config {
    Config {
        node_name: node_name.to_string(),
        enable_ipv4: true,
        enable_ipv6,
        vxlan: VxlanConfig { name: "vxlan100".to_string(), id: 100, port: 4789, disable_checksum_offload: false },
        tunnel_ipv4_mask: 24,
        tunnel_ipv6_mask: 64,
        tunnel_detect_method: TunnelDetectMethod::DefaultRouteInterface,
        forward_method,
        start_route_table: 500,
        control_plane: "http://127.0.0.1:8080".to_string(),
        poll_interval_secs: 5,
    }
}

fn peer_status(parent_ipv4: &str, vxlan_ipv4: &str, mac: [u8; 6]) -> NodeStatus {
    NodeStatus {
        physical_interface: "eth0".to_string(),
        physical_interface_ipv4: parent_ipv4.to_string(),
        physical_interface_ipv6: String::new(),
        vxlan_ipv4: vxlan_ipv4.to_string(),
        vxlan_ipv6: String::new(),
        tunnel_mac: egress_mesh_agent::types::format_mac(mac),
        phase: egress_mesh_agent::types::NodePhase::Succeeded,
    }
}

/// A self node's initial status: only the externally-assigned tunnel
/// identity is present. `physical_interface*`/`phase` are this agent's own
/// job to fill in during reconcile.
fn self_status(vxlan_ipv4: &str, mac: [u8; 6]) -> NodeStatus {
    NodeStatus { vxlan_ipv4: vxlan_ipv4.to_string(), tunnel_mac: egress_mesh_agent::types::format_mac(mac), ..Default::default() }
}

async fn seed_parent_addr(netlink: &FakeNetlink, ifindex: u32, family: Family, ip: &str) {
    let addr = match family {
        Family::V4 => InnerAddr { family, v4: Some((ip.parse().unwrap(), 24)), v6: None },
        Family::V6 => InnerAddr { family, v4: None, v6: Some((ip.parse().unwrap(), 64)) },
    };
    netlink.addr_add(ifindex, &addr).await.unwrap();
}

async fn reconcile_node(reconciler: &Reconciler, name: &str) {
    reconciler
        .reconcile(&ReconcileRequest { kind: ObjectKind::Node, name: name.to_string(), deleted: false })
        .await
        .unwrap();
}

async fn reconcile_gateway(reconciler: &Reconciler, name: &str) {
    reconciler
        .reconcile(&ReconcileRequest { kind: ObjectKind::Gateway, name: name.to_string(), deleted: false })
        .await
        .unwrap();
}

/// S1: two nodes, single-path forwarding. Self ensures its vxlan device and
/// peer-a's FDB entry; an EgressGateway designating peer-a ready-and-active
/// then installs the policy route.
#[tokio::test]
async fn s1_single_path_two_peers() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_index = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_index, Family::V4, "10.0.0.1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject { name: "self".to_string(), status: self_status("172.16.0.1", [1; 6]), deleted: false });
    cluster.put_node(NodeObject {
        name: "peer-a".to_string(),
        status: peer_status("10.0.0.2", "172.16.0.2", [2; 6]),
        deleted: false,
    });
    cluster.put_gateway(GatewayObject {
        name: "gw1".to_string(),
        node_list: vec![GatewayNodeEntry { name: "peer-a".to_string(), ready: true, active: true }],
        deleted: false,
    });

    let reconciler = Reconciler::new(base_config("self", false, ForwardMethod::ActiveStandby), cluster, netlink.clone());
    reconcile_node(&reconciler, "self").await;
    reconcile_node(&reconciler, "peer-a").await;
    reconcile_gateway(&reconciler, "gw1").await;

    assert_eq!(netlink.rule_count(), 1);
    assert_eq!(netlink.route_count(), 1);
}

/// S2: the local node is itself the active egress gateway for a group. Its
/// cached route-peer state is cleared on that event, collapsing the
/// installed route — but the rule stays in place and peer-a's FDB/neighbor
/// state, driven independently by the node registry, is untouched.
#[tokio::test]
async fn s2_local_is_active_gateway_clears_route_not_fdb() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_index = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_index, Family::V4, "10.0.0.1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject { name: "self".to_string(), status: self_status("172.16.0.1", [1; 6]), deleted: false });
    cluster.put_node(NodeObject {
        name: "peer-a".to_string(),
        status: peer_status("10.0.0.2", "172.16.0.2", [2; 6]),
        deleted: false,
    });
    cluster.put_gateway(GatewayObject {
        name: "gw1".to_string(),
        node_list: vec![
            GatewayNodeEntry { name: "self".to_string(), ready: true, active: true },
            GatewayNodeEntry { name: "peer-a".to_string(), ready: true, active: false },
        ],
        deleted: false,
    });

    let reconciler = Reconciler::new(base_config("self", false, ForwardMethod::ActiveStandby), cluster, netlink.clone());
    reconcile_node(&reconciler, "self").await;
    reconcile_node(&reconciler, "peer-a").await;

    let vxlan_index = netlink.link_by_name("vxlan100").await.unwrap().unwrap().index;
    assert_eq!(netlink.neigh_count(vxlan_index), 2, "peer-a's FDB + inner neighbor entries must exist already");

    reconcile_gateway(&reconciler, "gw1").await;

    assert_eq!(netlink.rule_count(), 1, "rule stays installed even with no routed peers");
    assert_eq!(netlink.route_count(), 0, "local node being the active gateway must not route to itself");
    assert_eq!(netlink.neigh_count(vxlan_index), 2, "gateway reconcile must not disturb FDB/neighbor state");
}

/// S3: multipath (active-active) forwarding across three ready-and-active
/// gateway peers produces one route with three next-hops.
#[tokio::test]
async fn s3_multipath_three_peers() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_index = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_index, Family::V4, "10.0.0.1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject { name: "self".to_string(), status: self_status("172.16.0.1", [1; 6]), deleted: false });
    let mut node_list = Vec::new();
    for (i, mac_seed) in [2u8, 3, 4].into_iter().enumerate() {
        let name = format!("peer-{i}");
        cluster.put_node(NodeObject {
            name: name.clone(),
            status: peer_status(&format!("10.0.0.{mac_seed}"), &format!("172.16.0.{mac_seed}"), [mac_seed; 6]),
            deleted: false,
        });
        node_list.push(GatewayNodeEntry { name, ready: true, active: true });
    }
    cluster.put_gateway(GatewayObject { name: "gw1".to_string(), node_list, deleted: false });

    let reconciler = Reconciler::new(base_config("self", false, ForwardMethod::ActiveActive), cluster, netlink.clone());
    reconcile_node(&reconciler, "self").await;
    for i in 0..3 {
        reconcile_node(&reconciler, &format!("peer-{i}")).await;
    }
    reconcile_gateway(&reconciler, "gw1").await;

    let routes = netlink.route_list(500, Family::V4).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].multipath.len(), 3);
}

/// S4: removing a peer node object garbage collects its FDB and inner
/// neighbor entries, independent of gateway state.
#[tokio::test]
async fn s4_peer_removal_garbage_collects() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_index = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_index, Family::V4, "10.0.0.1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject { name: "self".to_string(), status: self_status("172.16.0.1", [1; 6]), deleted: false });
    cluster.put_node(NodeObject {
        name: "peer-a".to_string(),
        status: peer_status("10.0.0.2", "172.16.0.2", [2; 6]),
        deleted: false,
    });
    cluster.put_node(NodeObject {
        name: "peer-b".to_string(),
        status: peer_status("10.0.0.3", "172.16.0.3", [3; 6]),
        deleted: false,
    });

    let reconciler = Reconciler::new(base_config("self", false, ForwardMethod::ActiveActive), cluster, netlink.clone());
    reconcile_node(&reconciler, "self").await;
    reconcile_node(&reconciler, "peer-a").await;
    reconcile_node(&reconciler, "peer-b").await;

    let vxlan_index = netlink.link_by_name("vxlan100").await.unwrap().unwrap().index;
    assert_eq!(netlink.neigh_count(vxlan_index), 4, "two peers x (fdb + inner neigh)");

    reconciler
        .reconcile(&ReconcileRequest { kind: ObjectKind::Node, name: "peer-a".to_string(), deleted: true })
        .await
        .unwrap();

    assert_eq!(netlink.neigh_count(vxlan_index), 2, "peer-a's entries must be garbage collected");
}

/// S5: the keepalive loop repairs drift — an externally-deleted vxlan link
/// (and with it, all FDB/neighbor entries) reappears on the next tick
/// without any cluster event firing.
#[tokio::test(start_paused = true)]
async fn s5_keepalive_repairs_drift() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_index = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_index, Family::V4, "10.0.0.1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject { name: "self".to_string(), status: self_status("172.16.0.1", [1; 6]), deleted: false });
    cluster.put_node(NodeObject {
        name: "peer-a".to_string(),
        status: peer_status("10.0.0.2", "172.16.0.2", [2; 6]),
        deleted: false,
    });

    let reconciler = Arc::new(Reconciler::new(
        base_config("self", false, ForwardMethod::ActiveStandby),
        cluster,
        netlink.clone(),
    ));
    reconcile_node(&reconciler, "self").await;
    reconcile_node(&reconciler, "peer-a").await;

    let vxlan_index = netlink.link_by_name("vxlan100").await.unwrap().unwrap().index;
    assert_eq!(netlink.neigh_count(vxlan_index), 2);

    // simulate something external wiping the vxlan link and its entries
    netlink.link_del(vxlan_index).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(egress_mesh_agent::keepalive::run(
        reconciler.clone(),
        "self".to_string(),
        cancel.clone(),
    ));

    tokio::time::advance(Duration::from_millis(1500)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

    let new_index = netlink.link_by_name("vxlan100").await.unwrap().unwrap().index;
    assert_eq!(netlink.neigh_count(new_index), 2);
}

/// S6: dual-stack peers get both an IPv4 and IPv6 policy route, in separate
/// route tables, once a gateway designates the peer ready-and-active.
#[tokio::test]
async fn s6_dual_stack_separate_tables() {
    let netlink = Arc::new(FakeNetlink::new());
    let parent_v4 = netlink.seed_parent_link("eth0", [1; 6], Family::V4, 100);
    seed_parent_addr(&netlink, parent_v4, Family::V4, "10.0.0.1").await;
    let parent_v6 = netlink.seed_parent_link("eth0v6", [1; 6], Family::V6, 100);
    seed_parent_addr(&netlink, parent_v6, Family::V6, "fd00::1").await;
    let cluster = Arc::new(FakeClusterClient::new());
    cluster.put_node(NodeObject {
        name: "self".to_string(),
        status: NodeStatus {
            vxlan_ipv4: "172.16.0.1".to_string(),
            vxlan_ipv6: "fd10::1".to_string(),
            tunnel_mac: egress_mesh_agent::types::format_mac([1; 6]),
            ..Default::default()
        },
        deleted: false,
    });
    cluster.put_node(NodeObject {
        name: "peer-a".to_string(),
        status: NodeStatus {
            physical_interface: "eth0".to_string(),
            physical_interface_ipv4: "10.0.0.2".to_string(),
            physical_interface_ipv6: "fd00::2".to_string(),
            vxlan_ipv4: "172.16.0.2".to_string(),
            vxlan_ipv6: "fd10::2".to_string(),
            tunnel_mac: egress_mesh_agent::types::format_mac([2; 6]),
            phase: egress_mesh_agent::types::NodePhase::Succeeded,
        },
        deleted: false,
    });
    cluster.put_gateway(GatewayObject {
        name: "gw1".to_string(),
        node_list: vec![GatewayNodeEntry { name: "peer-a".to_string(), ready: true, active: true }],
        deleted: false,
    });

    let reconciler = Reconciler::new(base_config("self", true, ForwardMethod::ActiveStandby), cluster, netlink.clone());
    reconcile_node(&reconciler, "self").await;
    reconcile_node(&reconciler, "peer-a").await;
    reconcile_gateway(&reconciler, "gw1").await;

    let v4_routes = netlink.route_list(500, Family::V4).await.unwrap();
    let v6_routes = netlink.route_list(501, Family::V6).await.unwrap();
    assert_eq!(v4_routes.len(), 1);
    assert_eq!(v6_routes.len(), 1);
}
