//! Resource fingerprints.
//!
//! Two flavours are used by the engine:
//!
//! - [`content_hash`]: SHA-256 over the canonical JSON of an entity's
//!   business fields (metadata excluded by the caller). Equal hashes mean
//!   the persisted row needs nothing but a `last_sync_time` touch.
//! - [`snapshot_version`]: hex MD5 over the JSON of a full remote snapshot,
//!   used by the list-watchers as a cheap "resource version" so a watch can
//!   tell an unchanged re-list from a changed one.
//!
//! Canonical form relies on `serde_json`'s map type being BTreeMap-backed,
//! which serializes object keys in ascending order.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON of `fields`.
///
/// The caller passes a projection that already excludes metadata (surrogate
/// id, timestamps, creator/modifier, the hash column itself).
pub fn content_hash<T: Serialize>(fields: &T) -> anyhow::Result<String> {
    let value = serde_json::to_value(fields)?;
    let canonical = serde_json::to_string(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 digest of the JSON of a snapshot.
///
/// A change detector for polling, not an integrity check. Serialization
/// goes through `serde_json::Value` so key order is deterministic.
pub fn snapshot_version<T: Serialize>(snapshot: &[T]) -> anyhow::Result<String> {
    let value = serde_json::to_value(snapshot)?;
    let canonical = serde_json::to_string(&value)?;
    Ok(format!("{:x}", md5::compute(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_is_order_insensitive() {
        // serde_json maps are BTreeMap-backed, so two objects with the same
        // fields hash identically no matter the declaration order.
        let a = json!({"name": "n1", "status": "online", "cluster_id": 3});
        let b = json!({"cluster_id": 3, "status": "online", "name": "n1"});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn content_hash_changes_with_content() {
        let a = json!({"name": "n1", "status": "online"});
        let b = json!({"name": "n1", "status": "offline"});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let h = content_hash(&json!({"k": 1})).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn snapshot_version_is_md5_hex() {
        let v = snapshot_version(&[json!({"a": 1})]).unwrap();
        assert_eq!(v.len(), 32);
    }

    #[test]
    fn snapshot_version_detects_element_change() {
        let s1 = vec![json!({"vmid": 101, "status": "running"})];
        let s2 = vec![json!({"vmid": 101, "status": "stopped"})];
        assert_ne!(
            snapshot_version(&s1).unwrap(),
            snapshot_version(&s2).unwrap()
        );
    }

    #[test]
    fn empty_snapshot_has_stable_version() {
        let empty: Vec<serde_json::Value> = Vec::new();
        assert_eq!(
            snapshot_version(&empty).unwrap(),
            snapshot_version(&empty).unwrap()
        );
    }
}
