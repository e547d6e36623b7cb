//! Storage repository.

use super::{ts_from_sql, ts_to_sql, Database, UpsertOutcome};
use crate::fingerprint::content_hash;
use crate::model::StorageEntry;
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct StorageRepo {
    db: Database,
}

impl StorageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Natural-key upsert with content-hash dedup on
    /// (cluster_id, node_name, storage_name).
    pub fn upsert(&self, entry: &mut StorageEntry) -> anyhow::Result<UpsertOutcome> {
        entry.content_hash = content_hash(&entry.hash_fields())?;
        let now = Utc::now();
        let conn = self.db.conn()?;

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, content_hash FROM storage
                 WHERE cluster_id = ?1 AND node_name = ?2 AND storage_name = ?3",
                params![entry.cluster_id, entry.node_name, entry.storage_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                entry.last_sync_time = Some(now);
                entry.create_time = Some(now);
                entry.update_time = Some(now);
                conn.execute(
                    "INSERT INTO storage
                        (cluster_id, node_name, storage_name, storage_type, content, shared,
                         active, enabled, avail, used, total, used_fraction, creator,
                         content_hash, last_sync_time, create_time, update_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        entry.cluster_id,
                        entry.node_name,
                        entry.storage_name,
                        entry.storage_type,
                        entry.content,
                        entry.shared,
                        entry.active,
                        entry.enabled,
                        entry.avail,
                        entry.used,
                        entry.total,
                        entry.used_fraction,
                        entry.creator,
                        entry.content_hash,
                        ts_to_sql(&entry.last_sync_time),
                        ts_to_sql(&entry.create_time),
                        ts_to_sql(&entry.update_time),
                    ],
                )?;
                entry.id = conn.last_insert_rowid();
                UpsertOutcome::Inserted
            }
            Some((id, stored_hash)) if stored_hash == entry.content_hash => {
                entry.id = id;
                entry.last_sync_time = Some(now);
                conn.execute(
                    "UPDATE storage SET last_sync_time = ?1 WHERE id = ?2",
                    params![ts_to_sql(&entry.last_sync_time), id],
                )?;
                UpsertOutcome::Unchanged
            }
            Some((id, _)) => {
                entry.id = id;
                entry.last_sync_time = Some(now);
                entry.update_time = Some(now);
                conn.execute(
                    "UPDATE storage SET
                        storage_type = ?1, content = ?2, shared = ?3, active = ?4,
                        enabled = ?5, avail = ?6, used = ?7, total = ?8,
                        used_fraction = ?9, creator = ?10, content_hash = ?11,
                        last_sync_time = ?12, update_time = ?13
                     WHERE id = ?14",
                    params![
                        entry.storage_type,
                        entry.content,
                        entry.shared,
                        entry.active,
                        entry.enabled,
                        entry.avail,
                        entry.used,
                        entry.total,
                        entry.used_fraction,
                        entry.creator,
                        entry.content_hash,
                        ts_to_sql(&entry.last_sync_time),
                        ts_to_sql(&entry.update_time),
                        id,
                    ],
                )?;
                UpsertOutcome::Updated
            }
        };

        crate::metrics::metrics()
            .reconcile_total
            .with_label_values(&["storage", outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    pub fn get_by_natural_key(
        &self,
        cluster_id: i64,
        node_name: &str,
        storage_name: &str,
    ) -> anyhow::Result<Option<StorageEntry>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM storage
                 WHERE cluster_id = ?1 AND node_name = ?2 AND storage_name = ?3"
            ),
            params![cluster_id, node_name, storage_name],
            row_to_storage,
        )
        .optional()
        .context("failed to query storage by natural key")
    }

    pub fn list_by_cluster(&self, cluster_id: i64) -> anyhow::Result<Vec<StorageEntry>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM storage WHERE cluster_id = ?1 ORDER BY node_name, storage_name"
        ))?;
        let rows = stmt.query_map(params![cluster_id], row_to_storage)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Delete by natural key. Unknown keys are a no-op.
    pub fn delete(
        &self,
        cluster_id: i64,
        node_name: &str,
        storage_name: &str,
    ) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "DELETE FROM storage
             WHERE cluster_id = ?1 AND node_name = ?2 AND storage_name = ?3",
            params![cluster_id, node_name, storage_name],
        )?;
        if affected > 0 {
            crate::metrics::metrics()
                .reconcile_total
                .with_label_values(&["storage", "deleted"])
                .inc();
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, cluster_id, node_name, storage_name, storage_type, content, shared, \
                       active, enabled, avail, used, total, used_fraction, creator, content_hash, \
                       last_sync_time, create_time, update_time";

fn row_to_storage(row: &Row<'_>) -> rusqlite::Result<StorageEntry> {
    Ok(StorageEntry {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        node_name: row.get(2)?,
        storage_name: row.get(3)?,
        storage_type: row.get(4)?,
        content: row.get(5)?,
        shared: row.get(6)?,
        active: row.get(7)?,
        enabled: row.get(8)?,
        avail: row.get(9)?,
        used: row.get(10)?,
        total: row.get(11)?,
        used_fraction: row.get(12)?,
        creator: row.get(13)?,
        content_hash: row.get(14)?,
        last_sync_time: ts_from_sql(row.get(15)?),
        create_time: ts_from_sql(row.get(16)?),
        update_time: ts_from_sql(row.get(17)?),
    })
}
