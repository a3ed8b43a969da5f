use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use egress_mesh_agent::cluster::{ClusterClient, HttpClusterClient, PollingEventSource};
use egress_mesh_agent::config::Args;
use egress_mesh_agent::keepalive;
use egress_mesh_agent::netlink::NetlinkPort;
use egress_mesh_agent::reconciler::Reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-node".to_string());
    let config = args.into_config(hostname)?;
    info!(node = %config.node_name, "starting egress mesh agent");

    let netlink = build_netlink()?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(HttpClusterClient::new(config.control_plane.clone())?);

    let node_name = config.node_name.clone();
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let reconciler = Arc::new(Reconciler::new(config, cluster.clone(), netlink));

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);

    let event_source = PollingEventSource::new(cluster, poll_interval);
    let event_source_cancel = cancel.clone();
    let event_source_handle = tokio::spawn(event_source.run(tx, event_source_cancel));

    let reconciler_for_loop = reconciler.clone();
    let reconcile_loop_handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            if let Err(e) = reconciler_for_loop.reconcile(&request).await {
                error!(kind = ?request.kind, name = %request.name, error = %e, "reconcile failed");
            }
        }
    });

    let keepalive_cancel = cancel.clone();
    let keepalive_handle = tokio::spawn(keepalive::run(reconciler, node_name, keepalive_cancel));

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    cancel.cancel();

    let _ = event_source_handle.await;
    let _ = keepalive_handle.await;
    reconcile_loop_handle.abort();

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(target_os = "linux")]
fn build_netlink() -> anyhow::Result<Arc<dyn NetlinkPort>> {
    Ok(Arc::new(egress_mesh_agent::netlink::linux::LinuxNetlink::new()?))
}

#[cfg(not(target_os = "linux"))]
fn build_netlink() -> anyhow::Result<Arc<dyn NetlinkPort>> {
    anyhow::bail!("egress-mesh-agent manages Linux kernel networking and cannot run on this platform")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
