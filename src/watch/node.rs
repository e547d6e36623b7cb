//! Node list-watcher.

use crate::api::ClusterClient;
use crate::informer::ListerWatcher;
use crate::model::Node;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Lists nodes and joins the cluster status listing to attach each node's
/// IP address.
pub struct NodeListerWatcher {
    client: Arc<ClusterClient>,
    cluster_id: i64,
    env: String,
    poll_interval: Duration,
}

impl NodeListerWatcher {
    pub fn new(
        client: Arc<ClusterClient>,
        cluster_id: i64,
        env: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            cluster_id,
            env,
            poll_interval,
        }
    }
}

#[async_trait]
impl ListerWatcher<Node> for NodeListerWatcher {
    async fn list(&self) -> anyhow::Result<Vec<Node>> {
        let items = self.client.list_nodes().await?;
        let status = self.client.cluster_status().await?;

        let ip_by_node: HashMap<String, String> = status
            .into_iter()
            .filter(|item| item.kind == "node")
            .map(|item| (item.name, item.ip.unwrap_or_default()))
            .collect();

        let mut nodes: Vec<Node> = items
            .into_iter()
            .map(|item| Node {
                cluster_id: self.cluster_id,
                ip: ip_by_node.get(&item.node).cloned().unwrap_or_default(),
                name: item.node,
                env: self.env.clone(),
                status: item.status,
                is_schedulable: true,
                ..Default::default()
            })
            .collect();
        // Stable order keeps the snapshot fingerprint stable across polls.
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
