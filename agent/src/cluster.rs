//! Polling substitute for the watch-based informer machinery a real
//! Kubernetes controller would use. `ClusterClient` is the read/write seam
//! against the control plane; `PollingEventSource` turns periodic list
//! snapshots into the same `(kind, name)` reconcile events a watch would
//! produce, including synthetic deletes when an object drops out of a list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{GatewayObject, NodeObject, NodeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Gateway,
    Node,
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub kind: ObjectKind,
    pub name: String,
    pub deleted: bool,
}

/// Read/write seam against the cluster's object store. Production code
/// talks JSON-over-HTTP to the control plane; tests bind a `FakeClusterClient`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_gateways(&self) -> anyhow::Result<Vec<GatewayObject>>;
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeObject>>;
    async fn get_gateway(&self, name: &str) -> anyhow::Result<Option<GatewayObject>>;
    async fn get_node(&self, name: &str) -> anyhow::Result<Option<NodeObject>>;
    async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> anyhow::Result<()>;
}

/// reqwest-backed client speaking JSON to the control plane's polling API.
/// Mirrors the teacher's `ControlClient`: one base URL, anyhow-contextualized
/// errors on non-success responses.
pub struct HttpClusterClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpClusterClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, base_url: base_url.into() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn list_gateways(&self) -> anyhow::Result<Vec<GatewayObject>> {
        let resp = self.http.get(self.url("/egressgateways")).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("list gateways failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeObject>> {
        let resp = self.http.get(self.url("/egressnodes")).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("list nodes failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn get_gateway(&self, name: &str) -> anyhow::Result<Option<GatewayObject>> {
        let resp = self.http.get(self.url(&format!("/egressgateways/{name}"))).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("get gateway {name} failed: {}", resp.status());
        }
        Ok(Some(resp.json().await?))
    }

    async fn get_node(&self, name: &str) -> anyhow::Result<Option<NodeObject>> {
        let resp = self.http.get(self.url(&format!("/egressnodes/{name}"))).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("get node {name} failed: {}", resp.status());
        }
        Ok(Some(resp.json().await?))
    }

    async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Patch<'a> {
            status: &'a NodeStatus,
        }
        let resp = self
            .http
            .patch(self.url(&format!("/egressnodes/{name}/status")))
            .json(&Patch { status })
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("patch status for {name} failed: {}", resp.status());
        }
        Ok(())
    }
}

/// Turns periodic `list_gateways`/`list_nodes` snapshots into reconcile
/// events by diffing against the previous snapshot's name set. An object
/// present before and absent now is emitted once more as `deleted: true`.
pub struct PollingEventSource {
    client: Arc<dyn ClusterClient>,
    interval: Duration,
    seen_gateways: HashMap<String, u64>,
    seen_nodes: HashMap<String, u64>,
}

impl PollingEventSource {
    pub fn new(client: Arc<dyn ClusterClient>, interval: Duration) -> Self {
        Self { client, interval, seen_gateways: HashMap::new(), seen_nodes: HashMap::new() }
    }

    pub async fn run(mut self, tx: mpsc::Sender<ReconcileRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("polling event source shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.poll_once(&tx).await {
                        warn!(error = %e, "poll cycle failed");
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self, tx: &mpsc::Sender<ReconcileRequest>) -> anyhow::Result<()> {
        let gateways = self.client.list_gateways().await?;
        let mut current: HashMap<String, u64> = HashMap::new();
        for gw in &gateways {
            let hash = content_hash(gw);
            current.insert(gw.name.clone(), hash);
            if self.seen_gateways.get(&gw.name) != Some(&hash) {
                let _ = tx
                    .send(ReconcileRequest { kind: ObjectKind::Gateway, name: gw.name.clone(), deleted: false })
                    .await;
            }
        }
        for name in self.seen_gateways.keys() {
            if !current.contains_key(name) {
                let _ = tx
                    .send(ReconcileRequest { kind: ObjectKind::Gateway, name: name.clone(), deleted: true })
                    .await;
            }
        }
        self.seen_gateways = current;

        let nodes = self.client.list_nodes().await?;
        let mut current: HashMap<String, u64> = HashMap::new();
        for node in &nodes {
            let hash = content_hash(node);
            current.insert(node.name.clone(), hash);
            if self.seen_nodes.get(&node.name) != Some(&hash) {
                let _ = tx
                    .send(ReconcileRequest { kind: ObjectKind::Node, name: node.name.clone(), deleted: false })
                    .await;
            }
        }
        for name in self.seen_nodes.keys() {
            if !current.contains_key(name) {
                let _ = tx
                    .send(ReconcileRequest { kind: ObjectKind::Node, name: name.clone(), deleted: true })
                    .await;
            }
        }
        self.seen_nodes = current;

        Ok(())
    }
}

fn content_hash(value: &impl Serialize) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// In-memory cluster store used by unit and integration tests. Mutating
/// helpers are synchronous for test ergonomics; the trait surface stays
/// async to match the production client.
#[cfg(feature = "test-support")]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeClusterClient {
        gateways: Mutex<HashMap<String, GatewayObject>>,
        nodes: Mutex<HashMap<String, NodeObject>>,
    }

    impl FakeClusterClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_gateway(&self, gw: GatewayObject) {
            self.gateways.lock().unwrap().insert(gw.name.clone(), gw);
        }

        pub fn put_node(&self, node: NodeObject) {
            self.nodes.lock().unwrap().insert(node.name.clone(), node);
        }

        pub fn remove_node(&self, name: &str) {
            self.nodes.lock().unwrap().remove(name);
        }

        pub fn patched_status(&self, name: &str) -> Option<NodeStatus> {
            self.nodes.lock().unwrap().get(name).map(|n| n.status.clone())
        }
    }

    #[async_trait]
    impl ClusterClient for FakeClusterClient {
        async fn list_gateways(&self) -> anyhow::Result<Vec<GatewayObject>> {
            Ok(self.gateways.lock().unwrap().values().cloned().collect())
        }

        async fn list_nodes(&self) -> anyhow::Result<Vec<NodeObject>> {
            Ok(self.nodes.lock().unwrap().values().cloned().collect())
        }

        async fn get_gateway(&self, name: &str) -> anyhow::Result<Option<GatewayObject>> {
            Ok(self.gateways.lock().unwrap().get(name).cloned())
        }

        async fn get_node(&self, name: &str) -> anyhow::Result<Option<NodeObject>> {
            Ok(self.nodes.lock().unwrap().get(name).cloned())
        }

        async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> anyhow::Result<()> {
            if let Some(node) = self.nodes.lock().unwrap().get_mut(name) {
                node.status = status.clone();
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn poll_once_emits_event_for_new_node() {
        let fake = Arc::new(FakeClusterClient::new());
        fake.put_node(NodeObject { name: "n1".to_string(), status: Default::default(), deleted: false });
        let mut source = PollingEventSource::new(fake.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(8);
        source.poll_once(&tx).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "n1");
        assert!(!event.deleted);
    }

    #[tokio::test]
    async fn poll_once_emits_delete_when_node_disappears() {
        let fake = Arc::new(FakeClusterClient::new());
        fake.put_node(NodeObject { name: "n1".to_string(), status: Default::default(), deleted: false });
        let mut source = PollingEventSource::new(fake.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(8);
        source.poll_once(&tx).await.unwrap();
        rx.try_recv().unwrap();

        fake.remove_node("n1");
        source.poll_once(&tx).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "n1");
        assert!(event.deleted);
    }

    #[tokio::test]
    async fn poll_once_is_silent_when_nothing_changed() {
        let fake = Arc::new(FakeClusterClient::new());
        fake.put_node(NodeObject { name: "n1".to_string(), status: Default::default(), deleted: false });
        let mut source = PollingEventSource::new(fake.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(8);
        source.poll_once(&tx).await.unwrap();
        rx.try_recv().unwrap();
        source.poll_once(&tx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
