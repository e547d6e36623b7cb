//! Event handlers and the cluster supervisor.
//!
//! One reconciler per resource kind turns informer deltas into repository
//! upserts and deletes. Reconcilers are stateless beyond their repository
//! handles and cluster context, idempotent by construction, and never
//! propagate errors past the informer loop.

mod node;
mod storage;
mod supervisor;
mod vm;

pub use node::NodeReconciler;
pub use storage::StorageReconciler;
pub use supervisor::ClusterSupervisor;
pub use vm::VmReconciler;
