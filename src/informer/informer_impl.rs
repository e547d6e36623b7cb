//! Composition of reflector, FIFO, store and event handlers.

use super::delta_fifo::{Delta, DeltaFifo, DeltaKind, KeyFn};
use super::lister_watcher::ListerWatcher;
use super::reflector::Reflector;
use super::store::ThreadSafeStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sleep between polls when the delta queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Capability set invoked for every dispatched delta.
///
/// Handlers are called sequentially in registration order. An error aborts
/// the remaining handlers for that delta and the delta stays consumed; the
/// next resync re-emits the state, so handlers must be idempotent.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn on_add(&self, obj: &T) -> anyhow::Result<()>;
    async fn on_update(&self, old: &T, new: &T) -> anyhow::Result<()>;
    async fn on_delete(&self, obj: &T) -> anyhow::Result<()>;
}

/// One informer: a reflector feeding a FIFO feeding registered handlers,
/// with a store mirroring the most recent observed state.
pub struct Informer<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    kind: String,
    store: Arc<ThreadSafeStore<T>>,
    fifo: Arc<DeltaFifo<T>>,
    key_of: KeyFn<T>,
    reflector: Arc<Reflector<T>>,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Informer<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Wire up an informer for one resource kind.
    ///
    /// `kind` only labels logs and metrics. `parent` scopes the informer's
    /// lifetime: cancelling the parent token stops this informer too.
    pub fn new(
        kind: impl Into<String>,
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        key_of: KeyFn<T>,
        handlers: Vec<Arc<dyn EventHandler<T>>>,
        resync_period: Duration,
        watch_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let store = Arc::new(ThreadSafeStore::new());
        let fifo = Arc::new(DeltaFifo::new(key_of.clone(), store.clone()));
        let reflector = Arc::new(Reflector::new(
            lister_watcher,
            fifo.clone(),
            resync_period,
            watch_interval,
        ));
        Self {
            kind: kind.into(),
            store,
            fifo,
            key_of,
            reflector,
            handlers,
            token: parent.child_token(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The store of last-observed objects. Read-only for callers; FIFO
    /// operations are the only writers.
    pub fn store(&self) -> &Arc<ThreadSafeStore<T>> {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn fifo(&self) -> &Arc<DeltaFifo<T>> {
        &self.fifo
    }

    /// True once the initial listing has been fully dispatched.
    pub fn has_synced(&self) -> bool {
        self.fifo.has_synced()
    }

    /// Start the reflector and the processing loop.
    pub fn run(self: &Arc<Self>) {
        let reflector = self.reflector.clone();
        let reflector_token = self.token.clone();
        let reflector_worker = tokio::spawn(async move {
            reflector.run(reflector_token).await;
        });

        let informer = self.clone();
        let process_worker = tokio::spawn(async move {
            informer.process_loop().await;
        });

        let mut workers = self.workers.lock();
        workers.push(reflector_worker);
        workers.push(process_worker);
    }

    /// Cancel and join the background workers.
    pub async fn stop(&self) {
        self.token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn process_loop(&self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }
            crate::metrics::metrics()
                .fifo_depth
                .with_label_values(&[self.kind.as_str()])
                .set(self.fifo.depth() as i64);

            match self.fifo.pop() {
                Some(delta) => self.dispatch(delta).await,
                None => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, delta: Delta<T>) {
        match delta.kind {
            DeltaKind::Added => {
                for handler in &self.handlers {
                    if let Err(e) = handler.on_add(&delta.object).await {
                        tracing::warn!(kind = %self.kind, "add handler failed: {e:#}");
                        break;
                    }
                }
            }
            DeltaKind::Updated => {
                let prior = (self.key_of)(&delta.object)
                    .ok()
                    .and_then(|key| self.store.get(&key));
                for handler in &self.handlers {
                    let result = match &prior {
                        Some(old) => handler.on_update(old, &delta.object).await,
                        // No prior state cached: degrade to an add.
                        None => handler.on_add(&delta.object).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(kind = %self.kind, "update handler failed: {e:#}");
                        break;
                    }
                }
            }
            DeltaKind::Deleted => {
                for handler in &self.handlers {
                    if let Err(e) = handler.on_delete(&delta.object).await {
                        tracing::warn!(kind = %self.kind, "delete handler failed: {e:#}");
                        break;
                    }
                }
            }
        }
    }
}
