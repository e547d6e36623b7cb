//! Ordered queue of add/update/delete records backed by the object store.

use super::store::ThreadSafeStore;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// What happened to an object relative to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

/// One queued change. For `Deleted`, `object` carries the last-observed
/// state; consumers needing a tombstone must capture it in their delete
/// handler because the store no longer holds it.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub object: T,
}

/// Derives the cache key for an object. The only way a FIFO operation can
/// fail is this function failing.
pub type KeyFn<T> = Arc<dyn Fn(&T) -> anyhow::Result<String> + Send + Sync>;

/// FIFO of deltas plus the store that mirrors them.
///
/// The store is advanced here, at enqueue time, never by the consumer.
/// Deltas are consumed strictly in order and are not coalesced.
pub struct DeltaFifo<T> {
    key_of: KeyFn<T>,
    deltas: Mutex<VecDeque<Delta<T>>>,
    store: Arc<ThreadSafeStore<T>>,
}

impl<T: Clone> DeltaFifo<T> {
    pub fn new(key_of: KeyFn<T>, store: Arc<ThreadSafeStore<T>>) -> Self {
        Self {
            key_of,
            deltas: Mutex::new(VecDeque::new()),
            store,
        }
    }

    /// Enqueue an object. Emits `Updated` when the key is already cached,
    /// `Added` otherwise; the store is overwritten either way.
    pub fn add(&self, obj: T) -> anyhow::Result<()> {
        self.upsert(obj)
    }

    /// Same semantics as [`Self::add`].
    pub fn update(&self, obj: T) -> anyhow::Result<()> {
        self.upsert(obj)
    }

    fn upsert(&self, obj: T) -> anyhow::Result<()> {
        let key = (self.key_of)(&obj)?;
        let mut deltas = self.deltas.lock();
        let kind = if self.store.contains(&key) {
            DeltaKind::Updated
        } else {
            DeltaKind::Added
        };
        self.store.update(key, obj.clone());
        deltas.push_back(Delta { kind, object: obj });
        Ok(())
    }

    /// Enqueue a deletion. Unknown keys are ignored, which makes repeated
    /// deletes idempotent.
    pub fn delete(&self, obj: T) -> anyhow::Result<()> {
        let key = (self.key_of)(&obj)?;
        let mut deltas = self.deltas.lock();
        if !self.store.contains(&key) {
            return Ok(());
        }
        self.store.delete(&key);
        deltas.push_back(Delta {
            kind: DeltaKind::Deleted,
            object: obj,
        });
        Ok(())
    }

    /// Detach the head delta, if any. The caller processes it outside any
    /// FIFO lock.
    pub fn pop(&self) -> Option<Delta<T>> {
        self.deltas.lock().pop_front()
    }

    /// Diff `snapshot` against the store and enqueue the minimal delta
    /// set: `Added` for new keys, `Updated` for keys present in both, and
    /// `Deleted` for keys that vanished. The store mirrors the snapshot
    /// afterwards.
    pub fn replace(&self, snapshot: Vec<T>) -> anyhow::Result<()> {
        let mut keyed: HashMap<String, T> = HashMap::with_capacity(snapshot.len());
        for obj in snapshot {
            let key = (self.key_of)(&obj)?;
            keyed.insert(key, obj);
        }

        let mut deltas = self.deltas.lock();
        for key in self.store.keys() {
            if !keyed.contains_key(&key) {
                if let Some(last_seen) = self.store.get(&key) {
                    deltas.push_back(Delta {
                        kind: DeltaKind::Deleted,
                        object: last_seen,
                    });
                }
            }
        }
        for (key, obj) in &keyed {
            let kind = if self.store.contains(key) {
                DeltaKind::Updated
            } else {
                DeltaKind::Added
            };
            deltas.push_back(Delta {
                kind,
                object: obj.clone(),
            });
        }
        self.store.replace(keyed);
        Ok(())
    }

    /// True once every queued delta has been consumed.
    pub fn has_synced(&self) -> bool {
        self.deltas.lock().is_empty()
    }

    /// Queue depth, exported as a gauge; the FIFO itself is unbounded.
    pub fn depth(&self) -> usize {
        self.deltas.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo() -> DeltaFifo<(&'static str, u32)> {
        let store = Arc::new(ThreadSafeStore::new());
        DeltaFifo::new(
            Arc::new(|obj: &(&'static str, u32)| Ok(obj.0.to_string())),
            store,
        )
    }

    fn drain(f: &DeltaFifo<(&'static str, u32)>) -> Vec<(DeltaKind, &'static str, u32)> {
        let mut out = Vec::new();
        while let Some(d) = f.pop() {
            out.push((d.kind, d.object.0, d.object.1));
        }
        out
    }

    #[test]
    fn add_then_update_emits_added_then_updated() {
        let f = fifo();
        f.add(("vm-a", 1)).unwrap();
        f.add(("vm-a", 2)).unwrap();

        assert_eq!(
            drain(&f),
            vec![
                (DeltaKind::Added, "vm-a", 1),
                (DeltaKind::Updated, "vm-a", 2)
            ]
        );
        assert_eq!(f.store.get("vm-a"), Some(("vm-a", 2)));
    }

    #[test]
    fn delete_unknown_key_is_noop() {
        let f = fifo();
        f.delete(("ghost", 0)).unwrap();
        assert!(f.has_synced());
    }

    #[test]
    fn delete_removes_from_store() {
        let f = fifo();
        f.add(("vm-a", 1)).unwrap();
        f.delete(("vm-a", 1)).unwrap();

        let kinds: Vec<_> = drain(&f).into_iter().map(|(k, ..)| k).collect();
        assert_eq!(kinds, vec![DeltaKind::Added, DeltaKind::Deleted]);
        assert!(f.store.get("vm-a").is_none());
    }

    #[test]
    fn replace_diffs_against_store() {
        let f = fifo();
        f.replace(vec![("a", 1), ("b", 1)]).unwrap();
        drain(&f);

        // a survives, b vanishes, c appears
        f.replace(vec![("a", 2), ("c", 1)]).unwrap();
        let mut got = drain(&f);
        got.sort_by_key(|(_, name, _)| *name);

        assert_eq!(
            got,
            vec![
                (DeltaKind::Updated, "a", 2),
                (DeltaKind::Deleted, "b", 1),
                (DeltaKind::Added, "c", 1),
            ]
        );
        assert_eq!(f.store.len(), 2);
    }

    #[test]
    fn repeated_replace_emits_only_updates() {
        let f = fifo();
        let snapshot = vec![("a", 1), ("b", 2)];
        f.replace(snapshot.clone()).unwrap();
        drain(&f);

        f.replace(snapshot).unwrap();
        let kinds: Vec<_> = drain(&f).into_iter().map(|(k, ..)| k).collect();
        assert_eq!(kinds, vec![DeltaKind::Updated, DeltaKind::Updated]);
    }

    #[test]
    fn deleted_delta_carries_last_observed_state() {
        let f = fifo();
        f.replace(vec![("a", 7)]).unwrap();
        drain(&f);

        f.replace(Vec::new()).unwrap();
        let got = drain(&f);
        assert_eq!(got, vec![(DeltaKind::Deleted, "a", 7)]);
    }

    #[test]
    fn has_synced_tracks_queue_not_store() {
        let f = fifo();
        assert!(f.has_synced());
        f.add(("a", 1)).unwrap();
        assert!(!f.has_synced());
        f.pop();
        assert!(f.has_synced());
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn key_fn_failure_is_propagated() {
        let store = Arc::new(ThreadSafeStore::new());
        let f: DeltaFifo<(&'static str, u32)> = DeltaFifo::new(
            Arc::new(|obj: &(&'static str, u32)| {
                if obj.0.is_empty() {
                    anyhow::bail!("object has no key");
                }
                Ok(obj.0.to_string())
            }),
            store,
        );
        assert!(f.add(("", 1)).is_err());
        assert!(f.add(("ok", 1)).is_ok());
    }
}
