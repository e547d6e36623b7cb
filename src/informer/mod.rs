//! List-watch-cache framework.
//!
//! The remote hypervisor APIs are poll-only, so change notification is
//! synthesised: a [`ListerWatcher`] re-lists and fingerprints snapshots, a
//! [`Reflector`] turns listings into [`DeltaFifo`] entries by diffing
//! against a [`ThreadSafeStore`], and an [`Informer`] pops deltas and
//! dispatches them to registered [`EventHandler`]s in order.
//!
//! Ordering guarantees: strict FIFO within one delta queue, nothing across
//! queues. Handlers must be idempotent; periodic resyncs deliberately
//! re-emit `Updated` deltas for every object.

mod delta_fifo;
mod informer_impl;
mod lister_watcher;
mod reflector;
mod store;

pub use delta_fifo::{Delta, DeltaFifo, DeltaKind, KeyFn};
pub use informer_impl::{EventHandler, Informer};
pub use lister_watcher::{ListerWatcher, WatchOutcome};
pub use reflector::Reflector;
pub use store::ThreadSafeStore;
