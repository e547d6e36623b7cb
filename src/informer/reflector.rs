//! Drives a lister-watcher and feeds the delta FIFO.

use super::delta_fifo::DeltaFifo;
use super::lister_watcher::{ListerWatcher, WatchOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pump from a remote listing into a [`DeltaFifo`].
///
/// Lifecycle: one initial list seeds the FIFO via `replace`, then two
/// tickers interleave. The watch tick re-lists cheaply through the
/// fingerprint comparison; the resync tick re-lists unconditionally to
/// force `Updated` re-emission, which is what heals dropped deltas
/// downstream. List and watch failures are logged and retried on the next
/// tick; there is no backoff beyond the tick interval.
pub struct Reflector<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    lister_watcher: Arc<dyn ListerWatcher<T>>,
    fifo: Arc<DeltaFifo<T>>,
    resync_period: Duration,
    watch_interval: Duration,
}

impl<T> Reflector<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        fifo: Arc<DeltaFifo<T>>,
        resync_period: Duration,
        watch_interval: Duration,
    ) -> Self {
        Self {
            lister_watcher,
            fifo,
            resync_period,
            watch_interval,
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut version = String::new();

        match self.lister_watcher.list().await {
            Ok(items) => {
                version = items
                    .first()
                    .map(|obj| self.lister_watcher.resource_version(obj))
                    .unwrap_or_default();
                if let Err(e) = self.fifo.replace(items) {
                    tracing::warn!("reflector: initial replace failed: {e:#}");
                }
            }
            Err(e) => {
                tracing::warn!("reflector: initial list failed: {e:#}");
            }
        }

        let mut resync = tokio::time::interval(self.resync_period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the initial list above already covered
        // that round for both tickers.
        resync.tick().await;
        let mut watch = tokio::time::interval(self.watch_interval);
        watch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        watch.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = watch.tick() => self.watch_round(&mut version).await,
                _ = resync.tick() => self.resync_round(&mut version).await,
            }
        }
    }

    async fn watch_round(&self, version: &mut String) {
        match self.lister_watcher.watch(version).await {
            Ok(WatchOutcome::Unchanged) => {}
            Ok(WatchOutcome::Changed {
                version: new_version,
                items,
            }) => {
                *version = new_version;
                // An empty snapshot on the watch path is suspicious (a
                // flaky remote briefly answering with nothing would wipe
                // the store); full deletions propagate via the resync
                // re-list instead.
                if items.is_empty() {
                    return;
                }
                if let Err(e) = self.fifo.replace(items) {
                    tracing::warn!("reflector: watch replace failed: {e:#}");
                }
            }
            Err(e) => {
                tracing::warn!("reflector: watch failed, retrying next tick: {e:#}");
            }
        }
    }

    async fn resync_round(&self, version: &mut String) {
        match self.lister_watcher.list().await {
            Ok(items) => {
                *version = items
                    .first()
                    .map(|obj| self.lister_watcher.resource_version(obj))
                    .unwrap_or_default();
                if let Err(e) = self.fifo.replace(items) {
                    tracing::warn!("reflector: resync replace failed: {e:#}");
                }
            }
            Err(e) => {
                tracing::warn!("reflector: resync list failed, retrying next period: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::delta_fifo::DeltaKind;
    use super::super::lister_watcher::testing::ScriptedLister;
    use super::super::store::ThreadSafeStore;
    use super::*;
    use serde_json::json;

    fn key_of(obj: &serde_json::Value) -> anyhow::Result<String> {
        obj.get("vmid")
            .and_then(|v| v.as_u64())
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow::anyhow!("object has no vmid"))
    }

    fn fifo() -> Arc<DeltaFifo<serde_json::Value>> {
        Arc::new(DeltaFifo::new(
            Arc::new(key_of),
            Arc::new(ThreadSafeStore::new()),
        ))
    }

    async fn run_briefly(reflector: Reflector<serde_json::Value>, for_ms: u64) {
        let token = CancellationToken::new();
        let stop = token.clone();
        let worker = tokio::spawn(async move { reflector.run(stop).await });
        tokio::time::sleep(Duration::from_millis(for_ms)).await;
        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn initial_list_seeds_fifo() {
        let fifo = fifo();
        let lw = Arc::new(ScriptedLister::new(vec![Ok(vec![
            json!({"vmid": 101}),
            json!({"vmid": 102}),
        ])]));
        let reflector = Reflector::new(
            lw,
            fifo.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        run_briefly(reflector, 20).await;

        let mut kinds = Vec::new();
        while let Some(d) = fifo.pop() {
            kinds.push(d.kind);
        }
        assert_eq!(kinds, vec![DeltaKind::Added, DeltaKind::Added]);
    }

    #[tokio::test]
    async fn initial_list_failure_is_survived() {
        let fifo = fifo();
        let lw = Arc::new(ScriptedLister::new(vec![
            Err(anyhow::anyhow!("remote down")),
            Ok(vec![json!({"vmid": 101})]),
        ]));
        let reflector = Reflector::new(
            lw,
            fifo.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );

        run_briefly(reflector, 80).await;

        let delta = fifo.pop().expect("watch tick should have re-listed");
        assert_eq!(delta.kind, DeltaKind::Added);
    }

    #[tokio::test]
    async fn watch_emits_deletion_deltas() {
        let fifo = fifo();
        let lw = Arc::new(ScriptedLister::new(vec![
            Ok(vec![json!({"vmid": 101}), json!({"vmid": 102})]),
            Ok(vec![json!({"vmid": 101})]),
        ]));
        let reflector = Reflector::new(
            lw,
            fifo.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );

        run_briefly(reflector, 80).await;

        let mut deleted = Vec::new();
        while let Some(d) = fifo.pop() {
            if d.kind == DeltaKind::Deleted {
                deleted.push(d.object["vmid"].as_u64().unwrap());
            }
        }
        assert_eq!(deleted, vec![102]);
    }

    #[tokio::test]
    async fn resync_re_emits_updates() {
        let fifo = fifo();
        // One snapshot forever: the watch path sees it unchanged, only the
        // resync path re-emits.
        let lw = Arc::new(ScriptedLister::new(vec![Ok(vec![json!({"vmid": 101})])]));
        let reflector = Reflector::new(
            lw,
            fifo.clone(),
            Duration::from_millis(15),
            Duration::from_secs(3600),
        );

        run_briefly(reflector, 80).await;

        let mut kinds = Vec::new();
        while let Some(d) = fifo.pop() {
            kinds.push(d.kind);
        }
        assert_eq!(kinds.first(), Some(&DeltaKind::Added));
        assert!(
            kinds[1..].iter().all(|k| *k == DeltaKind::Updated),
            "resync must re-emit updates, got {kinds:?}"
        );
        assert!(kinds.len() >= 2, "at least one resync should have fired");
    }
}
