//! Cluster repository, including the transitive delete cascade.

use super::{ts_from_sql, ts_to_sql, Database};
use crate::model::Cluster;
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct ClusterRepo {
    db: Database,
}

impl ClusterRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new cluster. Name uniqueness is enforced by the schema.
    pub fn create(&self, cluster: &mut Cluster) -> anyhow::Result<()> {
        let now = Utc::now();
        cluster.create_time = Some(now);
        cluster.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO cluster
                (name, alias, api_url, credential_id, credential_secret, env, region,
                 datacenter, is_schedulable, is_enabled, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                cluster.name,
                cluster.alias,
                cluster.api_url,
                cluster.credential_id,
                cluster.credential_secret,
                cluster.env,
                cluster.region,
                cluster.datacenter,
                cluster.is_schedulable,
                cluster.is_enabled,
                ts_to_sql(&cluster.create_time),
                ts_to_sql(&cluster.update_time),
            ],
        )
        .with_context(|| format!("failed to create cluster {:?}", cluster.name))?;
        cluster.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Cluster>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM cluster WHERE id = ?1"),
            params![id],
            row_to_cluster,
        )
        .optional()
        .context("failed to query cluster by id")
    }

    pub fn get_by_name(&self, name: &str) -> anyhow::Result<Option<Cluster>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM cluster WHERE name = ?1"),
            params![name],
            row_to_cluster,
        )
        .optional()
        .context("failed to query cluster by name")
    }

    /// The set the supervisor reconciles against.
    pub fn list_enabled(&self) -> anyhow::Result<Vec<Cluster>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM cluster WHERE is_enabled = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_cluster)?;
        let mut clusters = Vec::new();
        for row in rows {
            clusters.push(row?);
        }
        Ok(clusters)
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE cluster SET is_enabled = ?1, update_time = ?2 WHERE id = ?3",
            params![enabled, Some(Utc::now().to_rfc3339()), id],
        )?;
        Ok(())
    }

    /// Remove a cluster and everything it transitively owns, in dependency
    /// order, inside one transaction.
    pub fn delete_cascade(&self, id: i64) -> anyhow::Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM ip_address WHERE cluster_id = ?1", params![id])?;
        tx.execute("DELETE FROM vm WHERE cluster_id = ?1", params![id])?;
        tx.execute("DELETE FROM storage WHERE cluster_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM template_sync_task WHERE cluster_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM template_instance WHERE cluster_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM template_upload WHERE cluster_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM template WHERE cluster_id = ?1", params![id])?;
        tx.execute("DELETE FROM node WHERE cluster_id = ?1", params![id])?;
        tx.execute("DELETE FROM cluster WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

const COLUMNS: &str = "id, name, alias, api_url, credential_id, credential_secret, env, region, \
                       datacenter, is_schedulable, is_enabled, create_time, update_time";

fn row_to_cluster(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        id: row.get(0)?,
        name: row.get(1)?,
        alias: row.get(2)?,
        api_url: row.get(3)?,
        credential_id: row.get(4)?,
        credential_secret: row.get(5)?,
        env: row.get(6)?,
        region: row.get(7)?,
        datacenter: row.get(8)?,
        is_schedulable: row.get(9)?,
        is_enabled: row.get(10)?,
        create_time: ts_from_sql(row.get(11)?),
        update_time: ts_from_sql(row.get(12)?),
    })
}
