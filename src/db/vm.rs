//! VM repository.
//!
//! Lookups are id-first: the surrogate id or (vmid, node_id) pair drive
//! every write path. Name-based access exists only to resolve the delete
//! path's (vmid, node_name) reference and stale-row reconciliation after a
//! template conversion.

use super::{ts_from_sql, ts_to_sql, Database, UpsertOutcome};
use crate::fingerprint::content_hash;
use crate::model::Vm;
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct VmRepo {
    db: Database,
}

impl VmRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Natural-key upsert with content-hash dedup on (vmid, node_id).
    pub fn upsert(&self, vm: &mut Vm) -> anyhow::Result<UpsertOutcome> {
        vm.content_hash = content_hash(&vm.hash_fields())?;
        let now = Utc::now();
        let conn = self.db.conn()?;

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, content_hash FROM vm WHERE vmid = ?1 AND node_id = ?2",
                params![vm.vmid, vm.node_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                vm.last_sync_time = Some(now);
                vm.create_time = Some(now);
                vm.update_time = Some(now);
                conn.execute(
                    "INSERT INTO vm
                        (cluster_id, cluster_name, node_id, node_name, vmid, name, cpu, memory,
                         storage_name, is_template, template_id, status, node_ip, creator,
                         content_hash, last_sync_time, create_time, update_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    params![
                        vm.cluster_id,
                        vm.cluster_name,
                        vm.node_id,
                        vm.node_name,
                        vm.vmid,
                        vm.name,
                        vm.cpu,
                        vm.memory,
                        vm.storage_name,
                        vm.is_template,
                        vm.template_id,
                        vm.status,
                        vm.node_ip,
                        vm.creator,
                        vm.content_hash,
                        ts_to_sql(&vm.last_sync_time),
                        ts_to_sql(&vm.create_time),
                        ts_to_sql(&vm.update_time),
                    ],
                )?;
                vm.id = conn.last_insert_rowid();
                UpsertOutcome::Inserted
            }
            Some((id, stored_hash)) if stored_hash == vm.content_hash => {
                vm.id = id;
                vm.last_sync_time = Some(now);
                conn.execute(
                    "UPDATE vm SET last_sync_time = ?1 WHERE id = ?2",
                    params![ts_to_sql(&vm.last_sync_time), id],
                )?;
                UpsertOutcome::Unchanged
            }
            Some((id, _)) => {
                vm.id = id;
                vm.last_sync_time = Some(now);
                vm.update_time = Some(now);
                conn.execute(
                    "UPDATE vm SET
                        cluster_id = ?1, cluster_name = ?2, node_name = ?3, name = ?4,
                        cpu = ?5, memory = ?6, storage_name = ?7, is_template = ?8,
                        template_id = ?9, status = ?10, node_ip = ?11, creator = ?12,
                        content_hash = ?13, last_sync_time = ?14, update_time = ?15
                     WHERE id = ?16",
                    params![
                        vm.cluster_id,
                        vm.cluster_name,
                        vm.node_name,
                        vm.name,
                        vm.cpu,
                        vm.memory,
                        vm.storage_name,
                        vm.is_template,
                        vm.template_id,
                        vm.status,
                        vm.node_ip,
                        vm.creator,
                        vm.content_hash,
                        ts_to_sql(&vm.last_sync_time),
                        ts_to_sql(&vm.update_time),
                        id,
                    ],
                )?;
                UpsertOutcome::Updated
            }
        };

        crate::metrics::metrics()
            .reconcile_total
            .with_label_values(&["vm", outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Vm>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM vm WHERE id = ?1"),
            params![id],
            row_to_vm,
        )
        .optional()
        .context("failed to query vm by id")
    }

    pub fn get_by_vmid_and_node_id(
        &self,
        vmid: u32,
        node_id: i64,
    ) -> anyhow::Result<Option<Vm>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM vm WHERE vmid = ?1 AND node_id = ?2"),
            params![vmid, node_id],
            row_to_vm,
        )
        .optional()
        .context("failed to query vm by vmid and node id")
    }

    /// Delete-path resolution: a remote deletion event only carries the
    /// hypervisor-native (vmid, node_name) pair.
    pub fn get_by_vmid_and_node_name(
        &self,
        cluster_id: i64,
        vmid: u32,
        node_name: &str,
    ) -> anyhow::Result<Option<Vm>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM vm WHERE cluster_id = ?1 AND vmid = ?2 AND node_name = ?3"
            ),
            params![cluster_id, vmid, node_name],
            row_to_vm,
        )
        .optional()
        .context("failed to query vm by vmid and node name")
    }

    pub fn list_by_cluster(&self, cluster_id: i64) -> anyhow::Result<Vec<Vm>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM vm WHERE cluster_id = ?1 ORDER BY node_name, vmid"
        ))?;
        let rows = stmt.query_map(params![cluster_id], row_to_vm)?;
        let mut vms = Vec::new();
        for row in rows {
            vms.push(row?);
        }
        Ok(vms)
    }

    pub fn delete_by_id(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        let affected = conn.execute("DELETE FROM vm WHERE id = ?1", params![id])?;
        if affected > 0 {
            crate::metrics::metrics()
                .reconcile_total
                .with_label_values(&["vm", "deleted"])
                .inc();
        }
        Ok(())
    }

    /// Remove a stale non-template row left behind by a sync clone. Used
    /// by the sync engine before it records the converted template, so
    /// readers never see the intermediate as a plain VM.
    pub fn delete_stale_non_template(&self, vmid: u32, node_id: i64) -> anyhow::Result<bool> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "DELETE FROM vm WHERE vmid = ?1 AND node_id = ?2 AND is_template = 0",
            params![vmid, node_id],
        )?;
        Ok(affected > 0)
    }
}

const COLUMNS: &str = "id, cluster_id, cluster_name, node_id, node_name, vmid, name, cpu, memory, \
                       storage_name, is_template, template_id, status, node_ip, creator, \
                       content_hash, last_sync_time, create_time, update_time";

fn row_to_vm(row: &Row<'_>) -> rusqlite::Result<Vm> {
    Ok(Vm {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        cluster_name: row.get(2)?,
        node_id: row.get(3)?,
        node_name: row.get(4)?,
        vmid: row.get(5)?,
        name: row.get(6)?,
        cpu: row.get(7)?,
        memory: row.get(8)?,
        storage_name: row.get(9)?,
        is_template: row.get(10)?,
        template_id: row.get(11)?,
        status: row.get(12)?,
        node_ip: row.get(13)?,
        creator: row.get(14)?,
        content_hash: row.get(15)?,
        last_sync_time: ts_from_sql(row.get(16)?),
        create_time: ts_from_sql(row.get(17)?),
        update_time: ts_from_sql(row.get(18)?),
    })
}
