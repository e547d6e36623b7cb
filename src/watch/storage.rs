//! Storage list-watcher for one node.

use crate::api::ClusterClient;
use crate::informer::ListerWatcher;
use crate::model::StorageEntry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Lists the storages visible on a single node. No content filter applies
/// at list time for storages.
pub struct StorageListerWatcher {
    client: Arc<ClusterClient>,
    cluster_id: i64,
    node_name: String,
    poll_interval: Duration,
}

impl StorageListerWatcher {
    pub fn new(
        client: Arc<ClusterClient>,
        cluster_id: i64,
        node_name: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            cluster_id,
            node_name,
            poll_interval,
        }
    }
}

#[async_trait]
impl ListerWatcher<StorageEntry> for StorageListerWatcher {
    async fn list(&self) -> anyhow::Result<Vec<StorageEntry>> {
        let items = self.client.list_storages(&self.node_name).await?;

        let mut entries: Vec<StorageEntry> = items
            .into_iter()
            .map(|item| StorageEntry {
                cluster_id: self.cluster_id,
                node_name: self.node_name.clone(),
                storage_name: item.storage,
                storage_type: item.storage_type,
                content: item.content,
                shared: item.shared,
                active: item.active,
                enabled: item.enabled,
                avail: item.avail,
                used: item.used,
                total: item.total,
                used_fraction: item.used_fraction,
                ..Default::default()
            })
            .collect();
        entries.sort_by(|a, b| a.storage_name.cmp(&b.storage_name));
        Ok(entries)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cluster;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_maps_wire_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/storage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"storage": "local-lvm", "type": "lvmthin", "content": "images,rootdir",
                     "shared": 0, "active": 1, "enabled": 1,
                     "avail": 500, "used": 250, "total": 750, "used_fraction": "0.33"},
                    {"storage": "cephfs", "type": "cephfs", "content": "backup",
                     "shared": 1, "active": 1, "enabled": 1,
                     "avail": 1000, "used": 0, "total": 1000, "used_fraction": 0}
                ]
            })))
            .mount(&server)
            .await;

        let cluster = Cluster {
            id: 3,
            name: "lab".into(),
            alias: "lab".into(),
            api_url: server.uri(),
            credential_id: "svc@pam!inventory".into(),
            credential_secret: "secret".into(),
            env: "dev".into(),
            region: "eu".into(),
            datacenter: "dc1".into(),
            is_schedulable: true,
            is_enabled: true,
            create_time: None,
            update_time: None,
        };
        let lw = StorageListerWatcher::new(
            Arc::new(ClusterClient::new(&cluster).unwrap()),
            3,
            "n1".into(),
            Duration::from_secs(5),
        );

        let entries = lw.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].storage_name, "cephfs");
        assert!(entries[0].shared);
        assert_eq!(entries[1].storage_name, "local-lvm");
        assert!((entries[1].used_fraction - 0.33).abs() < 1e-9);
        assert!(entries.iter().all(|e| e.cluster_id == 3));
        assert!(entries.iter().all(|e| e.node_name == "n1"));
    }
}
