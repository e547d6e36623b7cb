//! Wire records for the remote hypervisor API.
//!
//! Remote payloads are untrusted: numeric fields may arrive as numbers or
//! strings, booleans as 0/1 integers, strings, or true/false, and any field
//! may be missing. The lenient deserializers below normalise all of that;
//! missing fields default to zero/empty.

use serde::{Deserialize, Deserializer};

/// Response envelope wrapping every remote payload.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub data: Option<T>,
}

// ── Lenient scalar decoding ─────────────────────────────────────

/// Any shape a remote scalar has been observed to take.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Scalar {
    Bool(bool),
    Int(i64),
    BigUint(u64),
    Float(f64),
    Str(String),
    Null(()),
}

impl Scalar {
    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            Self::Bool(b) => i64::from(*b),
            Self::Int(i) => *i,
            Self::BigUint(u) => i64::try_from(*u).unwrap_or(i64::MAX),
            Self::Float(f) => *f as i64,
            Self::Str(s) => {
                let t = s.trim();
                t.parse::<i64>()
                    .or_else(|_| t.parse::<f64>().map(|f| f as i64))
                    .unwrap_or(0)
            }
            Self::Null(()) => 0,
        }
    }

    pub(crate) fn as_u64(&self) -> u64 {
        u64::try_from(self.as_i64()).unwrap_or(0)
    }

    pub(crate) fn as_f64(&self) -> f64 {
        match self {
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Int(i) => *i as f64,
            Self::BigUint(u) => *u as f64,
            Self::Float(f) => *f,
            Self::Str(s) => s.trim().parse().unwrap_or(0.0),
            Self::Null(()) => 0.0,
        }
    }

    pub(crate) fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Str(s) => matches!(s.trim(), "1" | "true" | "on" | "yes"),
            other => other.as_i64() != 0,
        }
    }
}

pub(crate) fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|s| s.as_i64()).unwrap_or(0))
}

pub(crate) fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|s| s.as_u64()).unwrap_or(0))
}

pub(crate) fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?
        .map(|s| u32::try_from(s.as_u64()).unwrap_or(0))
        .unwrap_or(0))
}

pub(crate) fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|s| s.as_f64()).unwrap_or(0.0))
}

pub(crate) fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(|s| s.as_bool()).unwrap_or(false))
}

// ── Listing records ─────────────────────────────────────────────

/// `GET /nodes` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeItem {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub uptime: u64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub maxcpu: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxmem: u64,
}

/// `GET /cluster/status` entry. Items with `type == "node"` carry the
/// node-to-IP mapping the node watcher joins against.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterStatusItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// `GET /nodes/{node}/qemu` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuItem {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cpus: f64,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub template: bool,
}

/// `GET /nodes/{node}/storage` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageItem {
    #[serde(default)]
    pub storage: String,
    #[serde(rename = "type", default)]
    pub storage_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub shared: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub avail: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub used: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub total: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub used_fraction: f64,
}

/// `GET /cluster/resources` entry: a mixed list keyed by `type`, used for
/// aggregate capacity metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub storage: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub maxcpu: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub mem: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub maxdisk: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub disk: u64,
}

/// `GET /cluster/tasks` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    #[serde(default)]
    pub upid: String,
    #[serde(default)]
    pub node: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub starttime: i64,
    #[serde(default)]
    pub user: String,
}

/// `GET /nodes/{node}/tasks/{upid}/status` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Finished tasks report `OK` on success; anything else is a failure.
    pub fn succeeded(&self) -> bool {
        !self.is_running() && self.exitstatus.as_deref() == Some("OK")
    }

    pub fn exit_message(&self) -> String {
        self.exitstatus.clone().unwrap_or_else(|| "unknown".into())
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/config` payload, reduced to the fields
/// the engine inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub template: bool,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cores: f64,
    /// Memory in MiB as the remote config reports it.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub memory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_item_accepts_string_numbers() {
        let item: NodeItem = serde_json::from_str(
            r#"{"node":"n1","status":"online","uptime":"86400","maxcpu":"8","maxmem":"34359738368"}"#,
        )
        .unwrap();
        assert_eq!(item.uptime, 86_400);
        assert_eq!(item.maxcpu, 8.0);
        assert_eq!(item.maxmem, 34_359_738_368);
    }

    #[test]
    fn qemu_item_defaults_missing_fields() {
        let item: QemuItem = serde_json::from_str(r#"{"vmid":101}"#).unwrap();
        assert_eq!(item.vmid, 101);
        assert_eq!(item.name, "");
        assert_eq!(item.status, "");
        assert_eq!(item.maxmem, 0);
        assert!(!item.template);
    }

    #[test]
    fn template_flag_accepts_all_shapes() {
        for raw in [r#"{"template":1}"#, r#"{"template":"1"}"#, r#"{"template":true}"#] {
            let item: QemuItem = serde_json::from_str(raw).unwrap();
            assert!(item.template, "{raw}");
        }
        for raw in [r#"{"template":0}"#, r#"{"template":"0"}"#, r#"{}"#] {
            let item: QemuItem = serde_json::from_str(raw).unwrap();
            assert!(!item.template, "{raw}");
        }
    }

    #[test]
    fn storage_item_handles_nulls() {
        let item: StorageItem = serde_json::from_str(
            r#"{"storage":"local-lvm","type":"lvmthin","shared":0,"avail":null,"used_fraction":0.42}"#,
        )
        .unwrap();
        assert_eq!(item.storage, "local-lvm");
        assert_eq!(item.avail, 0);
        assert!((item.used_fraction - 0.42).abs() < f64::EPSILON);
        assert!(!item.shared);
    }

    #[test]
    fn cluster_status_splits_node_entries() {
        let items: Vec<ClusterStatusItem> = serde_json::from_str(
            r#"[{"type":"cluster","name":"fleet"},{"type":"node","name":"n1","ip":"10.0.0.1"}]"#,
        )
        .unwrap();
        let nodes: Vec<_> = items.iter().filter(|i| i.kind == "node").collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn task_status_success_requires_ok() {
        let ok: TaskStatus =
            serde_json::from_str(r#"{"status":"stopped","exitstatus":"OK"}"#).unwrap();
        assert!(ok.succeeded());

        let failed: TaskStatus =
            serde_json::from_str(r#"{"status":"stopped","exitstatus":"clone failed: exit code 1"}"#)
                .unwrap();
        assert!(!failed.succeeded());
        assert!(failed.exit_message().contains("clone failed"));

        let running: TaskStatus = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert!(running.is_running());
        assert!(!running.succeeded());
    }

    #[test]
    fn envelope_tolerates_null_data() {
        let env: Envelope<Vec<NodeItem>> = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(env.data.is_none());
    }
}
