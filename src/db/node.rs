//! Node repository.

use super::{ts_from_sql, ts_to_sql, Database, UpsertOutcome};
use crate::fingerprint::content_hash;
use crate::model::Node;
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct NodeRepo {
    db: Database,
}

impl NodeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Natural-key upsert with content-hash dedup.
    ///
    /// The incoming entity's `content_hash` is computed here; on the
    /// hash-equal branch only `last_sync_time` is written and
    /// `update_time` stays untouched.
    pub fn upsert(&self, node: &mut Node) -> anyhow::Result<UpsertOutcome> {
        node.content_hash = content_hash(&node.hash_fields())?;
        let now = Utc::now();
        let conn = self.db.conn()?;

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, content_hash FROM node WHERE cluster_id = ?1 AND name = ?2",
                params![node.cluster_id, node.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                node.last_sync_time = Some(now);
                node.create_time = Some(now);
                node.update_time = Some(now);
                conn.execute(
                    "INSERT INTO node
                        (cluster_id, name, ip, env, status, is_schedulable, vm_limit,
                         annotations, creator, content_hash, last_sync_time, create_time, update_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        node.cluster_id,
                        node.name,
                        node.ip,
                        node.env,
                        node.status,
                        node.is_schedulable,
                        node.vm_limit,
                        node.annotations,
                        node.creator,
                        node.content_hash,
                        ts_to_sql(&node.last_sync_time),
                        ts_to_sql(&node.create_time),
                        ts_to_sql(&node.update_time),
                    ],
                )?;
                node.id = conn.last_insert_rowid();
                UpsertOutcome::Inserted
            }
            Some((id, stored_hash)) if stored_hash == node.content_hash => {
                node.id = id;
                node.last_sync_time = Some(now);
                conn.execute(
                    "UPDATE node SET last_sync_time = ?1 WHERE id = ?2",
                    params![ts_to_sql(&node.last_sync_time), id],
                )?;
                UpsertOutcome::Unchanged
            }
            Some((id, _)) => {
                node.id = id;
                node.last_sync_time = Some(now);
                node.update_time = Some(now);
                conn.execute(
                    "UPDATE node SET
                        ip = ?1, env = ?2, status = ?3, is_schedulable = ?4,
                        vm_limit = ?5, annotations = ?6, creator = ?7,
                        content_hash = ?8, last_sync_time = ?9, update_time = ?10
                     WHERE id = ?11",
                    params![
                        node.ip,
                        node.env,
                        node.status,
                        node.is_schedulable,
                        node.vm_limit,
                        node.annotations,
                        node.creator,
                        node.content_hash,
                        ts_to_sql(&node.last_sync_time),
                        ts_to_sql(&node.update_time),
                        id,
                    ],
                )?;
                UpsertOutcome::Updated
            }
        };

        crate::metrics::metrics()
            .reconcile_total
            .with_label_values(&["node", outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    pub fn get_by_name(&self, cluster_id: i64, name: &str) -> anyhow::Result<Option<Node>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM node WHERE cluster_id = ?1 AND name = ?2"),
            params![cluster_id, name],
            row_to_node,
        )
        .optional()
        .context("failed to query node by name")
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Node>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM node WHERE id = ?1"),
            params![id],
            row_to_node,
        )
        .optional()
        .context("failed to query node by id")
    }

    pub fn list_by_cluster(&self, cluster_id: i64) -> anyhow::Result<Vec<Node>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM node WHERE cluster_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![cluster_id], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    /// Delete by natural key. Unknown names are a no-op.
    pub fn delete(&self, cluster_id: i64, name: &str) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "DELETE FROM node WHERE cluster_id = ?1 AND name = ?2",
            params![cluster_id, name],
        )?;
        if affected > 0 {
            crate::metrics::metrics()
                .reconcile_total
                .with_label_values(&["node", "deleted"])
                .inc();
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, cluster_id, name, ip, env, status, is_schedulable, vm_limit, \
                       annotations, creator, content_hash, last_sync_time, create_time, update_time";

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        name: row.get(2)?,
        ip: row.get(3)?,
        env: row.get(4)?,
        status: row.get(5)?,
        is_schedulable: row.get(6)?,
        vm_limit: row.get(7)?,
        annotations: row.get(8)?,
        creator: row.get(9)?,
        content_hash: row.get(10)?,
        last_sync_time: ts_from_sql(row.get(11)?),
        create_time: ts_from_sql(row.get(12)?),
        update_time: ts_from_sql(row.get(13)?),
    })
}
