//! Node reconciler.

use crate::db::NodeRepo;
use crate::informer::EventHandler;
use crate::model::Node;
use async_trait::async_trait;

pub struct NodeReconciler {
    repo: NodeRepo,
    cluster_id: i64,
}

impl NodeReconciler {
    pub fn new(repo: NodeRepo, cluster_id: i64) -> Self {
        Self { repo, cluster_id }
    }

    fn apply(&self, obj: &Node, preserve_creator: bool) -> anyhow::Result<()> {
        let mut node = obj.clone();
        node.cluster_id = self.cluster_id;

        // System-driven syncs must not overwrite operator-set provenance.
        if preserve_creator {
            if let Some(stored) = self.repo.get_by_name(self.cluster_id, &node.name)? {
                node.creator = stored.creator;
            }
        }

        let outcome = self.repo.upsert(&mut node)?;
        tracing::debug!(node = %node.name, outcome = outcome.as_str(), "node reconciled");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Node> for NodeReconciler {
    async fn on_add(&self, obj: &Node) -> anyhow::Result<()> {
        self.apply(obj, false)
    }

    async fn on_update(&self, _old: &Node, new: &Node) -> anyhow::Result<()> {
        self.apply(new, true)
    }

    async fn on_delete(&self, obj: &Node) -> anyhow::Result<()> {
        self.repo.delete(self.cluster_id, &obj.name)?;
        tracing::info!(node = %obj.name, cluster = self.cluster_id, "node removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_db;

    fn sample(name: &str, status: &str) -> Node {
        Node {
            name: name.into(),
            ip: "10.0.0.1".into(),
            env: "prod".into(),
            status: status.into(),
            is_schedulable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_stamps_cluster_id() {
        let (_tmp, db) = temp_db();
        let repo = NodeRepo::new(db);
        let handler = NodeReconciler::new(repo.clone(), 5);

        handler.on_add(&sample("n1", "online")).await.unwrap();

        let stored = repo.get_by_name(5, "n1").unwrap().unwrap();
        assert_eq!(stored.cluster_id, 5);
        assert!(stored.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn update_preserves_operator_creator() {
        let (_tmp, db) = temp_db();
        let repo = NodeRepo::new(db);
        let handler = NodeReconciler::new(repo.clone(), 5);

        let mut seeded = sample("n1", "online");
        seeded.cluster_id = 5;
        seeded.creator = "operator".into();
        repo.upsert(&mut seeded).unwrap();

        // Remote snapshot knows nothing about the creator.
        let incoming = sample("n1", "offline");
        handler.on_update(&seeded, &incoming).await.unwrap();

        let stored = repo.get_by_name(5, "n1").unwrap().unwrap();
        assert_eq!(stored.status, "offline");
        assert_eq!(stored.creator, "operator");
    }

    #[tokio::test]
    async fn repeated_apply_is_idempotent() {
        let (_tmp, db) = temp_db();
        let repo = NodeRepo::new(db);
        let handler = NodeReconciler::new(repo.clone(), 5);

        let node = sample("n1", "online");
        handler.on_add(&node).await.unwrap();
        handler.on_add(&node).await.unwrap();
        handler.on_update(&node, &node).await.unwrap();

        assert_eq!(repo.list_by_cluster(5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_by_natural_key() {
        let (_tmp, db) = temp_db();
        let repo = NodeRepo::new(db);
        let handler = NodeReconciler::new(repo.clone(), 5);

        handler.on_add(&sample("n1", "online")).await.unwrap();
        handler.on_delete(&sample("n1", "online")).await.unwrap();
        assert!(repo.get_by_name(5, "n1").unwrap().is_none());

        // Re-emitted deletions stay no-ops.
        handler.on_delete(&sample("n1", "online")).await.unwrap();
    }
}
