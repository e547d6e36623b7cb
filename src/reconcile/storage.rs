//! Storage reconciler.

use crate::db::StorageRepo;
use crate::informer::EventHandler;
use crate::model::StorageEntry;
use async_trait::async_trait;

pub struct StorageReconciler {
    repo: StorageRepo,
    cluster_id: i64,
}

impl StorageReconciler {
    pub fn new(repo: StorageRepo, cluster_id: i64) -> Self {
        Self { repo, cluster_id }
    }

    fn apply(&self, obj: &StorageEntry, preserve_creator: bool) -> anyhow::Result<()> {
        let mut entry = obj.clone();
        entry.cluster_id = self.cluster_id;

        if preserve_creator {
            if let Some(stored) = self.repo.get_by_natural_key(
                self.cluster_id,
                &entry.node_name,
                &entry.storage_name,
            )? {
                entry.creator = stored.creator;
            }
        }

        let outcome = self.repo.upsert(&mut entry)?;
        tracing::debug!(
            storage = %entry.storage_name,
            node = %entry.node_name,
            outcome = outcome.as_str(),
            "storage reconciled"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler<StorageEntry> for StorageReconciler {
    async fn on_add(&self, obj: &StorageEntry) -> anyhow::Result<()> {
        self.apply(obj, false)
    }

    async fn on_update(&self, _old: &StorageEntry, new: &StorageEntry) -> anyhow::Result<()> {
        self.apply(new, true)
    }

    async fn on_delete(&self, obj: &StorageEntry) -> anyhow::Result<()> {
        self.repo
            .delete(self.cluster_id, &obj.node_name, &obj.storage_name)?;
        tracing::info!(
            storage = %obj.storage_name,
            node = %obj.node_name,
            "storage removed"
        );
        Ok(())
    }
}
