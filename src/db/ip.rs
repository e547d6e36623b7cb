//! IP address pool repository.

use super::{ts_from_sql, ts_to_sql, Database};
use crate::model::IpAddress;
use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct IpAddressRepo {
    db: Database,
}

impl IpAddressRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, address: &mut IpAddress) -> anyhow::Result<()> {
        let now = Utc::now();
        address.create_time = Some(now);
        address.update_time = Some(now);
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO ip_address (cluster_id, ip, vm_id, status, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                address.cluster_id,
                address.ip,
                address.vm_id,
                address.status,
                ts_to_sql(&address.create_time),
                ts_to_sql(&address.update_time),
            ],
        )?;
        address.id = conn.last_insert_rowid();
        Ok(())
    }

    /// Bind the first free address of the cluster to a VM.
    pub fn assign_free(&self, cluster_id: i64, vm_id: i64) -> anyhow::Result<Option<IpAddress>> {
        let conn = self.db.conn()?;
        let free: Option<i64> = conn
            .query_row(
                "SELECT id FROM ip_address
                 WHERE cluster_id = ?1 AND status = 'free' ORDER BY id LIMIT 1",
                params![cluster_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = free else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE ip_address SET vm_id = ?1, status = 'assigned', update_time = ?2
             WHERE id = ?3",
            params![vm_id, Utc::now().to_rfc3339(), id],
        )?;
        self.get(id)
    }

    pub fn release(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE ip_address SET vm_id = NULL, status = 'free', update_time = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<IpAddress>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT id, cluster_id, ip, vm_id, status, create_time, update_time
             FROM ip_address WHERE id = ?1",
            params![id],
            row_to_ip,
        )
        .optional()
        .context("failed to query ip address")
    }

    pub fn list_by_cluster(&self, cluster_id: i64) -> anyhow::Result<Vec<IpAddress>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, cluster_id, ip, vm_id, status, create_time, update_time
             FROM ip_address WHERE cluster_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cluster_id], row_to_ip)?;
        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }
}

fn row_to_ip(row: &Row<'_>) -> rusqlite::Result<IpAddress> {
    Ok(IpAddress {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        ip: row.get(2)?,
        vm_id: row.get(3)?,
        status: row.get(4)?,
        create_time: ts_from_sql(row.get(5)?),
        update_time: ts_from_sql(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::temp_db;
    use super::*;

    fn sample(cluster_id: i64, ip: &str) -> IpAddress {
        IpAddress {
            id: 0,
            cluster_id,
            ip: ip.into(),
            vm_id: None,
            status: "free".into(),
            create_time: None,
            update_time: None,
        }
    }

    #[test]
    fn assign_and_release_cycle() {
        let (_tmp, db) = temp_db();
        let repo = IpAddressRepo::new(db);

        repo.create(&mut sample(1, "10.0.1.10")).unwrap();
        repo.create(&mut sample(1, "10.0.1.11")).unwrap();

        let assigned = repo.assign_free(1, 42).unwrap().unwrap();
        assert_eq!(assigned.status, "assigned");
        assert_eq!(assigned.vm_id, Some(42));

        let second = repo.assign_free(1, 43).unwrap().unwrap();
        assert_ne!(second.id, assigned.id);
        assert!(repo.assign_free(1, 44).unwrap().is_none());

        repo.release(assigned.id).unwrap();
        let reused = repo.assign_free(1, 44).unwrap().unwrap();
        assert_eq!(reused.id, assigned.id);
    }

    #[test]
    fn duplicate_ip_in_cluster_is_rejected() {
        let (_tmp, db) = temp_db();
        let repo = IpAddressRepo::new(db);

        repo.create(&mut sample(1, "10.0.1.10")).unwrap();
        assert!(repo.create(&mut sample(1, "10.0.1.10")).is_err());
        repo.create(&mut sample(2, "10.0.1.10")).unwrap();
    }
}
