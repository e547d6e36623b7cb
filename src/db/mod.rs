//! SQLite persistence.
//!
//! One [`Database`] handle wraps an r2d2 connection pool so WAL-mode reads
//! can parallelise; writes are serialised by SQLite's own page lock plus
//! the busy timeout. Schema is created idempotently at open.
//!
//! Every reconciled kind goes through the same natural-key upsert protocol
//! (see [`UpsertOutcome`]): a cheap indexed lookup of `(id, content_hash)`,
//! then insert, hash-equal touch, or full update. The hash-equal branch
//! writes only `last_sync_time` and leaves `update_time` alone, which is
//! what downstream change-data consumers key off.

mod cluster;
mod ip;
mod node;
mod storage;
mod sync_task;
mod template;
mod vm;

pub use cluster::ClusterRepo;
pub use ip::IpAddressRepo;
pub use node::NodeRepo;
pub use storage::StorageRepo;
pub use sync_task::SyncTaskRepo;
pub use template::TemplateRepo;
pub use vm::VmRepo;

use anyhow::Context;
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

/// Maximum pooled connections. The daemon is the only writer; this sizes
/// read parallelism for the per-node informer fan-out.
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Outcome of a natural-key upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed; a new one was inserted.
    Inserted,
    /// Row existed with a different content hash; fully replaced.
    Updated,
    /// Row existed with the same content hash; only `last_sync_time`
    /// was touched.
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Pooled SQLite handle, cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) the database file and initialise the schema.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database dir: {}", parent.display())
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous  = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA temp_store   = MEMORY;",
            )
        });
        let pool = r2d2::Pool::builder()
            .max_size(MAX_POOL_CONNECTIONS)
            .build(manager)
            .with_context(|| format!("failed to open database: {}", path.display()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(
        &self,
    ) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("database pool exhausted")
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cluster (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                name              TEXT NOT NULL UNIQUE,
                alias             TEXT NOT NULL DEFAULT '',
                api_url           TEXT NOT NULL DEFAULT '',
                credential_id     TEXT NOT NULL DEFAULT '',
                credential_secret TEXT NOT NULL DEFAULT '',
                env               TEXT NOT NULL DEFAULT '',
                region            TEXT NOT NULL DEFAULT '',
                datacenter        TEXT NOT NULL DEFAULT '',
                is_schedulable    INTEGER NOT NULL DEFAULT 1,
                is_enabled        INTEGER NOT NULL DEFAULT 0,
                create_time       TEXT,
                update_time       TEXT
            );

            CREATE TABLE IF NOT EXISTS node (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id     INTEGER NOT NULL,
                name           TEXT NOT NULL,
                ip             TEXT NOT NULL DEFAULT '',
                env            TEXT NOT NULL DEFAULT '',
                status         TEXT NOT NULL DEFAULT '',
                is_schedulable INTEGER NOT NULL DEFAULT 1,
                vm_limit       INTEGER NOT NULL DEFAULT 0,
                annotations    TEXT NOT NULL DEFAULT '',
                creator        TEXT NOT NULL DEFAULT '',
                content_hash   TEXT NOT NULL DEFAULT '',
                last_sync_time TEXT,
                create_time    TEXT,
                update_time    TEXT,
                UNIQUE(cluster_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_node_hash ON node(content_hash);

            CREATE TABLE IF NOT EXISTS vm (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id     INTEGER NOT NULL,
                cluster_name   TEXT NOT NULL DEFAULT '',
                node_id        INTEGER NOT NULL,
                node_name      TEXT NOT NULL DEFAULT '',
                vmid           INTEGER NOT NULL,
                name           TEXT NOT NULL DEFAULT '',
                cpu            REAL NOT NULL DEFAULT 0,
                memory         INTEGER NOT NULL DEFAULT 0,
                storage_name   TEXT NOT NULL DEFAULT '',
                is_template    INTEGER NOT NULL DEFAULT 0,
                template_id    INTEGER,
                status         TEXT NOT NULL DEFAULT '',
                node_ip        TEXT NOT NULL DEFAULT '',
                creator        TEXT NOT NULL DEFAULT '',
                content_hash   TEXT NOT NULL DEFAULT '',
                last_sync_time TEXT,
                create_time    TEXT,
                update_time    TEXT,
                UNIQUE(vmid, node_id)
            );
            CREATE INDEX IF NOT EXISTS idx_vm_hash ON vm(content_hash);
            CREATE INDEX IF NOT EXISTS idx_vm_node_name ON vm(node_name, vmid);

            CREATE TABLE IF NOT EXISTS storage (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id     INTEGER NOT NULL,
                node_name      TEXT NOT NULL,
                storage_name   TEXT NOT NULL,
                storage_type   TEXT NOT NULL DEFAULT '',
                content        TEXT NOT NULL DEFAULT '',
                shared         INTEGER NOT NULL DEFAULT 0,
                active         INTEGER NOT NULL DEFAULT 0,
                enabled        INTEGER NOT NULL DEFAULT 0,
                avail          INTEGER NOT NULL DEFAULT 0,
                used           INTEGER NOT NULL DEFAULT 0,
                total          INTEGER NOT NULL DEFAULT 0,
                used_fraction  REAL NOT NULL DEFAULT 0,
                creator        TEXT NOT NULL DEFAULT '',
                content_hash   TEXT NOT NULL DEFAULT '',
                last_sync_time TEXT,
                create_time    TEXT,
                update_time    TEXT,
                UNIQUE(cluster_id, node_name, storage_name)
            );
            CREATE INDEX IF NOT EXISTS idx_storage_hash ON storage(content_hash);

            CREATE TABLE IF NOT EXISTS template (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id  INTEGER NOT NULL,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                create_time TEXT,
                update_time TEXT
            );

            CREATE TABLE IF NOT EXISTS template_instance (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id  INTEGER NOT NULL,
                upload_id    INTEGER,
                cluster_id   INTEGER NOT NULL,
                node_id      INTEGER NOT NULL DEFAULT 0,
                node_name    TEXT NOT NULL DEFAULT '',
                storage_name TEXT NOT NULL DEFAULT '',
                is_shared    INTEGER NOT NULL DEFAULT 0,
                vmid         INTEGER,
                status       TEXT NOT NULL DEFAULT 'pending',
                sync_task_id INTEGER,
                is_primary   INTEGER NOT NULL DEFAULT 0,
                create_time  TEXT,
                update_time  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_instance_template ON template_instance(template_id);

            CREATE TABLE IF NOT EXISTS template_sync_task (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id     INTEGER NOT NULL,
                upload_id       INTEGER,
                cluster_id      INTEGER NOT NULL,
                source_node     TEXT NOT NULL DEFAULT '',
                target_node     TEXT NOT NULL DEFAULT '',
                storage_name    TEXT NOT NULL DEFAULT '',
                file_path       TEXT NOT NULL DEFAULT '',
                file_size       INTEGER NOT NULL DEFAULT 0,
                status          TEXT NOT NULL DEFAULT 'pending',
                progress        INTEGER NOT NULL DEFAULT 0,
                sync_start_time TEXT,
                sync_end_time   TEXT,
                error_message   TEXT NOT NULL DEFAULT '',
                create_time     TEXT,
                update_time     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_task_template ON template_sync_task(template_id);

            CREATE TABLE IF NOT EXISTS template_upload (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id  INTEGER NOT NULL,
                cluster_id   INTEGER NOT NULL,
                file_name    TEXT NOT NULL DEFAULT '',
                file_path    TEXT NOT NULL DEFAULT '',
                file_size    INTEGER NOT NULL DEFAULT 0,
                storage_name TEXT NOT NULL DEFAULT '',
                status       TEXT NOT NULL DEFAULT 'uploaded',
                create_time  TEXT,
                update_time  TEXT
            );

            CREATE TABLE IF NOT EXISTS ip_address (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id  INTEGER NOT NULL,
                ip          TEXT NOT NULL,
                vm_id       INTEGER,
                status      TEXT NOT NULL DEFAULT 'free',
                create_time TEXT,
                update_time TEXT,
                UNIQUE(cluster_id, ip)
            );",
        )?;
        Ok(())
    }
}

// ── Timestamp mapping ───────────────────────────────────────────

pub(crate) fn ts_to_sql(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

pub(crate) fn ts_from_sql(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Database;
    use tempfile::TempDir;

    pub(crate) use super::cluster::testing::sample_cluster;
    pub(crate) use super::sync_task::testing::sample_task;
    pub(crate) use super::template::testing::{sample_instance, sample_template};

    /// A database on a temp file; the TempDir must outlive the handle.
    pub(crate) fn temp_db() -> (TempDir, Database) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(&tmp.path().join("virtfleet.db")).unwrap();
        (tmp, db)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::temp_db;
    use super::*;

    #[test]
    fn open_creates_schema_idempotently() {
        let (tmp, _db) = temp_db();
        // Re-opening the same file must not fail on existing tables.
        let _again = Database::open(&tmp.path().join("virtfleet.db")).unwrap();
    }

    #[test]
    fn timestamp_round_trip() {
        let now = Some(Utc::now());
        assert_eq!(ts_from_sql(ts_to_sql(&now)), now);
        assert_eq!(ts_from_sql(None), None);
        assert_eq!(ts_from_sql(Some("garbage".into())), None);
    }
}
