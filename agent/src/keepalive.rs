//! Drift-repair loop: periodically re-runs the local node's own reconcile
//! regardless of whether any cluster event fired. Kernel state can drift
//! out from under the agent (another process deletes a route, a link
//! flaps) without the cluster objects themselves changing, so this is the
//! only thing that notices and repairs that class of drift.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cluster::{ObjectKind, ReconcileRequest};
use crate::reconciler::Reconciler;

const STEADY_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Runs until `cancel` fires. On success, sleeps `STEADY_INTERVAL` and logs
/// a single "converged" line the first time after a failure (or at
/// startup) so steady-state operation isn't noisy. On failure, logs the
/// error and retries after `RETRY_INTERVAL`.
pub async fn run(reconciler: Arc<Reconciler>, node_name: String, cancel: CancellationToken) {
    let mut quiet = false;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let request = ReconcileRequest { kind: ObjectKind::Node, name: node_name.clone(), deleted: false };
        match reconciler.reconcile(&request).await {
            Ok(()) => {
                if !quiet {
                    info!(node = %node_name, "vxlan and route state converged");
                    quiet = true;
                }
                if sleep_or_cancel(STEADY_INTERVAL, &cancel).await {
                    return;
                }
            }
            Err(e) => {
                error!(node = %node_name, error = %e, "keepalive reconcile failed");
                quiet = false;
                if sleep_or_cancel(RETRY_INTERVAL, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Returns `true` if cancellation won the race (caller should exit).
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use crate::config::{ForwardMethod, TunnelDetectMethod, VxlanConfig};
    use crate::config::Config;
    use crate::netlink::fake::FakeNetlink;
    use crate::netlink::{InnerAddr, NetlinkPort};
    use crate::types::{Family, NodeObject, NodeStatus};

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_promptly_on_cancel() {
        let fake_net = Arc::new(FakeNetlink::new());
        let parent_index = fake_net.seed_parent_link("eth0", [1; 6], Family::V4, 100);
        fake_net
            .addr_add(parent_index, &InnerAddr { family: Family::V4, v4: Some(("10.0.0.1".parse().unwrap(), 24)), v6: None })
            .await
            .unwrap();
        let fake_cluster = Arc::new(FakeClusterClient::new());
        let status = NodeStatus {
            vxlan_ipv4: "172.16.0.1".to_string(),
            tunnel_mac: crate::types::format_mac([1; 6]),
            ..Default::default()
        };
        fake_cluster.put_node(NodeObject { name: "n1".to_string(), status, deleted: false });

        let config = Config {
            node_name: "n1".to_string(),
            enable_ipv4: true,
            enable_ipv6: false,
            vxlan: VxlanConfig { name: "vxlan100".to_string(), id: 100, port: 4789, disable_checksum_offload: false },
            tunnel_ipv4_mask: 24,
            tunnel_ipv6_mask: 64,
            tunnel_detect_method: TunnelDetectMethod::DefaultRouteInterface,
            forward_method: ForwardMethod::ActiveStandby,
            start_route_table: 500,
            control_plane: "http://127.0.0.1:8080".to_string(),
            poll_interval_secs: 5,
        };

        let reconciler = Arc::new(Reconciler::new(config, fake_cluster, fake_net));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(reconciler, "n1".to_string(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
