//! Template sync task repository.
//!
//! The engine persists a task after every state transition, so a restart
//! can tell exactly how far each task got. Retry is the only transition
//! out of a terminal state and it is operator-driven.

use super::{ts_from_sql, ts_to_sql, Database};
use crate::model::{SyncTaskStatus, TemplateSyncTask};
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct SyncTaskRepo {
    db: Database,
}

impl SyncTaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, task: &mut TemplateSyncTask) -> anyhow::Result<()> {
        let now = Utc::now();
        task.create_time = Some(now);
        task.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO template_sync_task
                (template_id, upload_id, cluster_id, source_node, target_node, storage_name,
                 file_path, file_size, status, progress, sync_start_time, sync_end_time,
                 error_message, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                task.template_id,
                task.upload_id,
                task.cluster_id,
                task.source_node,
                task.target_node,
                task.storage_name,
                task.file_path,
                task.file_size,
                task.status.as_str(),
                task.progress,
                ts_to_sql(&task.sync_start_time),
                ts_to_sql(&task.sync_end_time),
                task.error_message,
                ts_to_sql(&task.create_time),
                ts_to_sql(&task.update_time),
            ],
        )?;
        task.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<TemplateSyncTask>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM template_sync_task WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .context("failed to query sync task")
    }

    pub fn list_by_template(&self, template_id: i64) -> anyhow::Result<Vec<TemplateSyncTask>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM template_sync_task WHERE template_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![template_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Enter `syncing` and stamp the start time.
    pub fn mark_started(&self, id: i64, progress: i64) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_sync_task
             SET status = ?1, progress = ?2, sync_start_time = ?3, error_message = '',
                 update_time = ?4
             WHERE id = ?5",
            params![SyncTaskStatus::Syncing.as_str(), progress, now, now, id],
        )?;
        Ok(())
    }

    /// Clone finished; migration to the target is in flight.
    pub fn mark_importing(&self, id: i64, progress: i64) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_sync_task SET status = ?1, progress = ?2, update_time = ?3
             WHERE id = ?4",
            params![
                SyncTaskStatus::Importing.as_str(),
                progress,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn update_progress(&self, id: i64, progress: i64) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_sync_task SET progress = ?1, update_time = ?2 WHERE id = ?3",
            params![progress, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn mark_completed(&self, id: i64) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_sync_task
             SET status = ?1, progress = 100, sync_end_time = ?2, update_time = ?3
             WHERE id = ?4",
            params![SyncTaskStatus::Completed.as_str(), now, now, id],
        )?;
        crate::metrics::metrics()
            .sync_tasks_total
            .with_label_values(&["completed"])
            .inc();
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE template_sync_task
             SET status = ?1, sync_end_time = ?2, error_message = ?3, update_time = ?4
             WHERE id = ?5",
            params![SyncTaskStatus::Failed.as_str(), now, error, now, id],
        )?;
        crate::metrics::metrics()
            .sync_tasks_total
            .with_label_values(&["failed"])
            .inc();
        Ok(())
    }

    /// Retry: flip a failed task back to pending. Returns false when the
    /// task is not currently failed (the caller treats that as a
    /// validation error, not a retriable condition).
    pub fn reset_for_retry(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "UPDATE template_sync_task
             SET status = ?1, progress = 0, error_message = '',
                 sync_start_time = NULL, sync_end_time = NULL, update_time = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                SyncTaskStatus::Pending.as_str(),
                Utc::now().to_rfc3339(),
                id,
                SyncTaskStatus::Failed.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }
}

const COLUMNS: &str = "id, template_id, upload_id, cluster_id, source_node, target_node, \
                       storage_name, file_path, file_size, status, progress, sync_start_time, \
                       sync_end_time, error_message, create_time, update_time";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TemplateSyncTask> {
    Ok(TemplateSyncTask {
        id: row.get(0)?,
        template_id: row.get(1)?,
        upload_id: row.get(2)?,
        cluster_id: row.get(3)?,
        source_node: row.get(4)?,
        target_node: row.get(5)?,
        storage_name: row.get(6)?,
        file_path: row.get(7)?,
        file_size: row.get(8)?,
        status: SyncTaskStatus::from_str_lossy(&row.get::<_, String>(9)?),
        progress: row.get(10)?,
        sync_start_time: ts_from_sql(row.get(11)?),
        sync_end_time: ts_from_sql(row.get(12)?),
        error_message: row.get(13)?,
        create_time: ts_from_sql(row.get(14)?),
        update_time: ts_from_sql(row.get(15)?),
    })
}


#[cfg(test)]
mod tests {
    use super::super::testing::temp_db;
    use super::testing::sample_task;
    use super::*;

    #[test]
    fn lifecycle_transitions_persist() {
        let (_tmp, db) = temp_db();
        let repo = SyncTaskRepo::new(db);

        let mut task = sample_task(1, 1, "n2");
        repo.create(&mut task).unwrap();

        repo.mark_started(task.id, 10).unwrap();
        let started = repo.get(task.id).unwrap().unwrap();
        assert_eq!(started.status, SyncTaskStatus::Syncing);
        assert_eq!(started.progress, 10);
        assert!(started.sync_start_time.is_some());
        assert!(started.sync_end_time.is_none());

        repo.mark_importing(task.id, 50).unwrap();
        assert_eq!(
            repo.get(task.id).unwrap().unwrap().status,
            SyncTaskStatus::Importing
        );

        repo.mark_completed(task.id).unwrap();
        let done = repo.get(task.id).unwrap().unwrap();
        assert_eq!(done.status, SyncTaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.sync_end_time.is_some());
    }

    #[test]
    fn failure_records_message() {
        let (_tmp, db) = temp_db();
        let repo = SyncTaskRepo::new(db);

        let mut task = sample_task(1, 1, "n2");
        repo.create(&mut task).unwrap();
        repo.mark_started(task.id, 10).unwrap();
        repo.mark_failed(task.id, "migration aborted by remote").unwrap();

        let failed = repo.get(task.id).unwrap().unwrap();
        assert_eq!(failed.status, SyncTaskStatus::Failed);
        assert!(failed.error_message.contains("migration aborted"));
    }

    #[test]
    fn retry_only_applies_to_failed_tasks() {
        let (_tmp, db) = temp_db();
        let repo = SyncTaskRepo::new(db);

        let mut task = sample_task(1, 1, "n2");
        repo.create(&mut task).unwrap();

        // Pending task: retry is rejected.
        assert!(!repo.reset_for_retry(task.id).unwrap());

        repo.mark_failed(task.id, "boom").unwrap();
        assert!(repo.reset_for_retry(task.id).unwrap());

        let reset = repo.get(task.id).unwrap().unwrap();
        assert_eq!(reset.status, SyncTaskStatus::Pending);
        assert_eq!(reset.progress, 0);
        assert!(reset.error_message.is_empty());
        assert!(reset.sync_start_time.is_none());
        assert!(reset.sync_end_time.is_none());
    }
}
