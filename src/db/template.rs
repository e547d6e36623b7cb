//! Template, template-instance and upload repositories.

use super::{ts_from_sql, ts_to_sql, Database};
use crate::model::{InstanceStatus, Template, TemplateInstance, TemplateUpload, UploadStatus};
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct TemplateRepo {
    db: Database,
}

impl TemplateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Templates ───────────────────────────────────────────────

    pub fn create(&self, template: &mut Template) -> anyhow::Result<()> {
        let now = Utc::now();
        template.create_time = Some(now);
        template.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO template (cluster_id, name, description, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                template.cluster_id,
                template.name,
                template.description,
                ts_to_sql(&template.create_time),
                ts_to_sql(&template.update_time),
            ],
        )?;
        template.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Template>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT id, cluster_id, name, description, create_time, update_time
             FROM template WHERE id = ?1",
            params![id],
            row_to_template,
        )
        .optional()
        .context("failed to query template")
    }

    /// (cluster_id, name) uniqueness is a reconciler convention, not a
    /// schema constraint; first match wins.
    pub fn get_by_name(&self, cluster_id: i64, name: &str) -> anyhow::Result<Option<Template>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT id, cluster_id, name, description, create_time, update_time
             FROM template WHERE cluster_id = ?1 AND name = ?2 ORDER BY id LIMIT 1",
            params![cluster_id, name],
            row_to_template,
        )
        .optional()
        .context("failed to query template by name")
    }

    // ── Instances ───────────────────────────────────────────────

    pub fn create_instance(&self, instance: &mut TemplateInstance) -> anyhow::Result<()> {
        let now = Utc::now();
        instance.create_time = Some(now);
        instance.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO template_instance
                (template_id, upload_id, cluster_id, node_id, node_name, storage_name,
                 is_shared, vmid, status, sync_task_id, is_primary, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                instance.template_id,
                instance.upload_id,
                instance.cluster_id,
                instance.node_id,
                instance.node_name,
                instance.storage_name,
                instance.is_shared,
                instance.vmid,
                instance.status.as_str(),
                instance.sync_task_id,
                instance.is_primary,
                ts_to_sql(&instance.create_time),
                ts_to_sql(&instance.update_time),
            ],
        )?;
        instance.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get_instance(&self, id: i64) -> anyhow::Result<Option<TemplateInstance>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM template_instance WHERE id = ?1"),
            params![id],
            row_to_instance,
        )
        .optional()
        .context("failed to query template instance")
    }

    /// The single primary instance a sync task clones from.
    pub fn primary_instance(&self, template_id: i64) -> anyhow::Result<Option<TemplateInstance>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM template_instance
                 WHERE template_id = ?1 AND is_primary = 1 ORDER BY id LIMIT 1"
            ),
            params![template_id],
            row_to_instance,
        )
        .optional()
        .context("failed to query primary instance")
    }

    pub fn list_instances(&self, template_id: i64) -> anyhow::Result<Vec<TemplateInstance>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM template_instance WHERE template_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![template_id], row_to_instance)?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    pub fn set_instance_status(&self, id: i64, status: InstanceStatus) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_instance SET status = ?1, update_time = ?2 WHERE id = ?3",
            params![status.as_str(), Some(Utc::now().to_rfc3339()), id],
        )?;
        Ok(())
    }

    pub fn set_instance_sync_task(&self, id: i64, sync_task_id: i64) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_instance SET sync_task_id = ?1, status = ?2, update_time = ?3
             WHERE id = ?4",
            params![
                sync_task_id,
                InstanceStatus::Syncing.as_str(),
                Some(Utc::now().to_rfc3339()),
                id
            ],
        )?;
        Ok(())
    }

    /// Terminal success: the instance now has a concrete vmid on its node.
    pub fn mark_instance_available(&self, id: i64, vmid: u32) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_instance SET status = ?1, vmid = ?2, update_time = ?3 WHERE id = ?4",
            params![
                InstanceStatus::Available.as_str(),
                vmid,
                Some(Utc::now().to_rfc3339()),
                id
            ],
        )?;
        Ok(())
    }

    /// Find the non-primary instance a sync task is materialising.
    pub fn instance_for_target(
        &self,
        template_id: i64,
        node_name: &str,
    ) -> anyhow::Result<Option<TemplateInstance>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM template_instance
                 WHERE template_id = ?1 AND node_name = ?2 AND is_primary = 0
                 ORDER BY id LIMIT 1"
            ),
            params![template_id, node_name],
            row_to_instance,
        )
        .optional()
        .context("failed to query target instance")
    }

    // ── Uploads ─────────────────────────────────────────────────

    pub fn create_upload(&self, upload: &mut TemplateUpload) -> anyhow::Result<()> {
        let now = Utc::now();
        upload.create_time = Some(now);
        upload.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO template_upload
                (template_id, cluster_id, file_name, file_path, file_size, storage_name,
                 status, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                upload.template_id,
                upload.cluster_id,
                upload.file_name,
                upload.file_path,
                upload.file_size,
                upload.storage_name,
                upload.status.as_str(),
                ts_to_sql(&upload.create_time),
                ts_to_sql(&upload.update_time),
            ],
        )?;
        upload.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get_upload(&self, id: i64) -> anyhow::Result<Option<TemplateUpload>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT id, template_id, cluster_id, file_name, file_path, file_size,
                    storage_name, status, create_time, update_time
             FROM template_upload WHERE id = ?1",
            params![id],
            row_to_upload,
        )
        .optional()
        .context("failed to query template upload")
    }

    pub fn set_upload_status(&self, id: i64, status: UploadStatus) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_upload SET status = ?1, update_time = ?2 WHERE id = ?3",
            params![status.as_str(), Some(Utc::now().to_rfc3339()), id],
        )?;
        Ok(())
    }
}

const INSTANCE_COLUMNS: &str = "id, template_id, upload_id, cluster_id, node_id, node_name, \
                                storage_name, is_shared, vmid, status, sync_task_id, is_primary, \
                                create_time, update_time";

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        create_time: ts_from_sql(row.get(4)?),
        update_time: ts_from_sql(row.get(5)?),
    })
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<TemplateInstance> {
    Ok(TemplateInstance {
        id: row.get(0)?,
        template_id: row.get(1)?,
        upload_id: row.get(2)?,
        cluster_id: row.get(3)?,
        node_id: row.get(4)?,
        node_name: row.get(5)?,
        storage_name: row.get(6)?,
        is_shared: row.get(7)?,
        vmid: row.get(8)?,
        status: InstanceStatus::from_str_lossy(&row.get::<_, String>(9)?),
        sync_task_id: row.get(10)?,
        is_primary: row.get(11)?,
        create_time: ts_from_sql(row.get(12)?),
        update_time: ts_from_sql(row.get(13)?),
    })
}

fn row_to_upload(row: &Row<'_>) -> rusqlite::Result<TemplateUpload> {
    Ok(TemplateUpload {
        id: row.get(0)?,
        template_id: row.get(1)?,
        cluster_id: row.get(2)?,
        file_name: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        storage_name: row.get(6)?,
        status: UploadStatus::from_str_lossy(&row.get::<_, String>(7)?),
        create_time: ts_from_sql(row.get(8)?),
        update_time: ts_from_sql(row.get(9)?),
    })
}
