//! Domain entities persisted by the reconciliation engine.
//!
//! Entities double as the informer object type: list-watchers map remote
//! wire records straight into these structs, leaving metadata (surrogate
//! id, timestamps, content hash) unset until a reconciler persists them.
//! Because the watch fingerprint serializes whole entities, watchers must
//! never stamp wall-clock values; only the repository layer does.
//!
//! Each reconciled kind exposes a `hash_fields` projection covering its
//! business fields only, which feeds [`crate::fingerprint::content_hash`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Cluster ─────────────────────────────────────────────────────

/// One logically independent hypervisor control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    /// Unique cluster name.
    pub name: String,
    pub alias: String,
    /// Base URL of the cluster's HTTP API.
    pub api_url: String,
    /// Token principal, e.g. `svc@pam!inventory`.
    pub credential_id: String,
    pub credential_secret: String,
    pub env: String,
    pub region: String,
    pub datacenter: String,
    pub is_schedulable: bool,
    /// Gates whether the supervisor reconciles this cluster at all.
    pub is_enabled: bool,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

// ── Node ────────────────────────────────────────────────────────

/// A physical host within a cluster. Natural key: (cluster_id, name).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub ip: String,
    pub env: String,
    pub status: String,
    pub is_schedulable: bool,
    pub vm_limit: i64,
    pub annotations: String,
    pub creator: String,
    pub content_hash: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Node {
    /// Business fields only; metadata excluded.
    pub fn hash_fields(&self) -> serde_json::Value {
        json!({
            "cluster_id": self.cluster_id,
            "name": self.name,
            "ip": self.ip,
            "env": self.env,
            "status": self.status,
            "is_schedulable": self.is_schedulable,
            "vm_limit": self.vm_limit,
            "annotations": self.annotations,
        })
    }
}

// ── VM ──────────────────────────────────────────────────────────

/// A virtual machine. Natural key: (vmid, node_id); vmid is the
/// hypervisor-native numeric identifier, the local id is the surrogate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vm {
    pub id: i64,
    pub cluster_id: i64,
    pub cluster_name: String,
    pub node_id: i64,
    pub node_name: String,
    pub vmid: u32,
    pub name: String,
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: i64,
    pub storage_name: String,
    pub is_template: bool,
    pub template_id: Option<i64>,
    pub status: String,
    pub node_ip: String,
    pub creator: String,
    pub content_hash: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Vm {
    pub fn hash_fields(&self) -> serde_json::Value {
        json!({
            "cluster_id": self.cluster_id,
            "cluster_name": self.cluster_name,
            "node_id": self.node_id,
            "node_name": self.node_name,
            "vmid": self.vmid,
            "name": self.name,
            "cpu": self.cpu,
            "memory": self.memory,
            "storage_name": self.storage_name,
            "is_template": self.is_template,
            "template_id": self.template_id,
            "status": self.status,
            "node_ip": self.node_ip,
        })
    }
}

// ── VM filter predicates ────────────────────────────────────────
//
// Applied at list time by the VM watcher and again by the VM reconciler.
// Both call sites share these functions so the two filter stages cannot
// drift apart.

/// Statuses during which a VM's reported shape is unreliable.
pub fn vm_status_unstable(status: &str) -> bool {
    matches!(status, "locked" | "migrating" | "creating" | "unknown" | "")
}

/// A half-created clone: no name and no resources yet.
pub fn vm_is_clone_intermediate(name: &str, cpu: f64, memory: i64) -> bool {
    name.is_empty() && cpu == 0.0 && memory == 0
}

/// A transient clone produced by the template sync engine. Once converted
/// (is_template set) the same name prefix is legitimate and must pass.
pub fn vm_is_transient_sync_clone(name: &str, is_template: bool) -> bool {
    name.starts_with("sync-") && !is_template
}

/// Combined list/handler filter. Returns true when the record should be
/// dropped rather than reconciled.
pub fn vm_filtered_out(status: &str, name: &str, cpu: f64, memory: i64, is_template: bool) -> bool {
    vm_status_unstable(status)
        || vm_is_clone_intermediate(name, cpu, memory)
        || vm_is_transient_sync_clone(name, is_template)
}

// ── Storage ─────────────────────────────────────────────────────

/// A storage backend visible on a node.
/// Natural key: (cluster_id, node_name, storage_name).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    pub id: i64,
    pub cluster_id: i64,
    pub node_name: String,
    pub storage_name: String,
    pub storage_type: String,
    pub content: String,
    pub shared: bool,
    pub active: bool,
    pub enabled: bool,
    pub avail: i64,
    pub used: i64,
    pub total: i64,
    pub used_fraction: f64,
    pub creator: String,
    pub content_hash: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl StorageEntry {
    pub fn hash_fields(&self) -> serde_json::Value {
        json!({
            "cluster_id": self.cluster_id,
            "node_name": self.node_name,
            "storage_name": self.storage_name,
            "storage_type": self.storage_type,
            "content": self.content,
            "shared": self.shared,
            "active": self.active,
            "enabled": self.enabled,
            "avail": self.avail,
            "used": self.used,
            "total": self.total,
            "used_fraction": self.used_fraction,
        })
    }
}

// ── Template ────────────────────────────────────────────────────

/// A VM marked as an immutable base image, tracked per cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub description: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

/// Lifecycle of a template instance on a specific node+storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Syncing,
    Available,
    Failed,
    Deleted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Available => "available",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "available" => Self::Available,
            "failed" => Self::Failed,
            "deleted" => Self::Deleted,
            _ => Self::Pending,
        }
    }
}

/// A concrete copy of a template on one node+storage.
/// At most one instance per template carries `is_primary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInstance {
    pub id: i64,
    pub template_id: i64,
    pub upload_id: Option<i64>,
    pub cluster_id: i64,
    pub node_id: i64,
    pub node_name: String,
    pub storage_name: String,
    pub is_shared: bool,
    pub vmid: Option<u32>,
    pub status: InstanceStatus,
    pub sync_task_id: Option<i64>,
    pub is_primary: bool,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

// ── Template sync task ──────────────────────────────────────────

/// State machine of a sync task. Transitions are performed by the engine
/// consumer, persisted after every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTaskStatus {
    Pending,
    Syncing,
    Importing,
    Completed,
    Failed,
}

impl SyncTaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Importing => "importing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "importing" => Self::Importing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Completed and failed tasks are terminal until an operator retries.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of template propagation: clone on the source node, migrate to
/// the target node, convert to a template there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSyncTask {
    pub id: i64,
    pub template_id: i64,
    pub upload_id: Option<i64>,
    pub cluster_id: i64,
    pub source_node: String,
    pub target_node: String,
    pub storage_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub status: SyncTaskStatus,
    /// 0..=100, advanced while remote steps poll.
    pub progress: i64,
    pub sync_start_time: Option<DateTime<Utc>>,
    pub sync_end_time: Option<DateTime<Utc>>,
    pub error_message: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

// ── Template upload ─────────────────────────────────────────────

/// Status of an uploaded template archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploaded,
    Imported,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Imported => "imported",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "imported" => Self::Imported,
            "failed" => Self::Failed,
            _ => Self::Uploaded,
        }
    }
}

/// An archive uploaded for template creation; sync tasks copy its
/// file path/size so progress reporting can show what is moving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateUpload {
    pub id: i64,
    pub template_id: i64,
    pub cluster_id: i64,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub storage_name: String,
    pub status: UploadStatus,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

// ── IP address pool ─────────────────────────────────────────────

/// An address in a cluster's pool, optionally bound to a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: i64,
    pub cluster_id: i64,
    pub ip: String,
    pub vm_id: Option<i64>,
    /// "free" or "assigned".
    pub status: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}
