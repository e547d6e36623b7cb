//! The list/watch contract for one (cluster, kind[, node]) combination.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::fingerprint::snapshot_version;

/// Result of a watch round.
#[derive(Debug, Clone)]
pub enum WatchOutcome<T> {
    /// Snapshot fingerprint matched the previous version.
    Unchanged,
    /// Remote state moved; carries the new version and the full snapshot.
    Changed { version: String, items: Vec<T> },
}

/// Adapter that turns a poll-only remote API into a restartable sequence of
/// typed objects.
///
/// Implementations only provide [`list`](Self::list) (with any cross-field
/// enrichment and list-time filtering) and a poll interval; the default
/// `watch` derives change detection from a content fingerprint over the
/// whole snapshot, blocking one poll interval when nothing moved so callers
/// can loop tightly.
#[async_trait]
pub trait ListerWatcher<T>: Send + Sync
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Fetch the current remote snapshot, mapped to internal types.
    async fn list(&self) -> anyhow::Result<Vec<T>>;

    /// How long `watch` blocks when the snapshot is unchanged.
    fn poll_interval(&self) -> Duration;

    /// Re-list and compare fingerprints against `prev_version`.
    async fn watch(&self, prev_version: &str) -> anyhow::Result<WatchOutcome<T>> {
        let items = self.list().await?;
        let version = snapshot_version(&items)?;
        if version == prev_version {
            tokio::time::sleep(self.poll_interval()).await;
            return Ok(WatchOutcome::Unchanged);
        }
        Ok(WatchOutcome::Changed { version, items })
    }

    /// Version of a single object, used to seed the reflector's previous
    /// version from the first element of the initial listing.
    fn resource_version(&self, obj: &T) -> String {
        snapshot_version(std::slice::from_ref(obj)).unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLister;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn watch_reports_unchanged_for_identical_snapshots() {
        let lw = ScriptedLister::new(vec![
            Ok(vec![json!({"vmid": 101})]),
            Ok(vec![json!({"vmid": 101})]),
        ]);

        let first = lw.list().await.unwrap();
        let version = snapshot_version(&first).unwrap();

        match lw.watch(&version).await.unwrap() {
            WatchOutcome::Unchanged => {}
            WatchOutcome::Changed { .. } => panic!("identical snapshot must be unchanged"),
        }
    }

    #[tokio::test]
    async fn watch_reports_change_with_new_version() {
        let lw = ScriptedLister::new(vec![
            Ok(vec![json!({"vmid": 101, "status": "running"})]),
            Ok(vec![json!({"vmid": 101, "status": "stopped"})]),
        ]);

        let first = lw.list().await.unwrap();
        let version = snapshot_version(&first).unwrap();

        match lw.watch(&version).await.unwrap() {
            WatchOutcome::Changed { version: v2, items } => {
                assert_ne!(v2, version);
                assert_eq!(items.len(), 1);
            }
            WatchOutcome::Unchanged => panic!("changed snapshot must be reported"),
        }
    }

    #[tokio::test]
    async fn resource_version_is_single_element_fingerprint() {
        let lw = ScriptedLister::new(vec![]);
        let obj = json!({"vmid": 7});
        assert_eq!(
            lw.resource_version(&obj),
            snapshot_version(std::slice::from_ref(&obj)).unwrap()
        );
    }
}
