//! Daemon configuration.
//!
//! Loaded from a TOML file; every section and field has a default so a
//! missing file or a partial file both work. Cluster records themselves
//! (API URL, credentials, enablement) live in the database, not here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub reconciler: ReconcilerConfig,
    pub template_sync: TemplateSyncConfig,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter (overridden by RUST_LOG when set).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Persistence section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("virtfleet.db"),
        }
    }
}

/// Reconciliation engine intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Full re-list interval in seconds.
    pub resync_period_secs: u64,
    /// Watch tick in seconds; also the block interval on an unchanged watch.
    pub poll_interval_secs: u64,
    /// Enabled-cluster set refresh interval in seconds.
    pub supervisor_tick_secs: u64,
    /// How long the per-cluster startup path waits for the initial node
    /// list before spawning per-node informers, in seconds.
    pub startup_node_wait_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_period_secs: 300,
            poll_interval_secs: 5,
            supervisor_tick_secs: 30,
            startup_node_wait_secs: 5,
        }
    }
}

impl ReconcilerConfig {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_secs(self.supervisor_tick_secs)
    }

    pub fn startup_node_wait(&self) -> Duration {
        Duration::from_secs(self.startup_node_wait_secs)
    }
}

/// Template sync engine bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSyncConfig {
    /// Bounded task-id channel capacity.
    pub queue_capacity: usize,
    /// Upper bound for the clone step, in seconds.
    pub clone_timeout_secs: u64,
    /// Upper bound for the migrate step, in seconds.
    pub migrate_timeout_secs: u64,
    /// Remote task poll interval, in seconds.
    pub task_poll_interval_secs: u64,
}

impl Default for TemplateSyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            clone_timeout_secs: 30 * 60,
            migrate_timeout_secs: 60 * 60,
            task_poll_interval_secs: 2,
        }
    }
}

impl TemplateSyncConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn migrate_timeout(&self) -> Duration {
        Duration::from_secs(self.migrate_timeout_secs)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_secs(self.task_poll_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", path.display())
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.reconciler.resync_period_secs, 300);
        assert_eq!(cfg.reconciler.poll_interval_secs, 5);
        assert_eq!(cfg.reconciler.supervisor_tick_secs, 30);
        assert_eq!(cfg.template_sync.queue_capacity, 100);
        assert_eq!(cfg.template_sync.clone_timeout_secs, 1800);
        assert_eq!(cfg.template_sync.migrate_timeout_secs, 3600);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [reconciler]
            poll_interval_secs = 2

            [database]
            path = "/var/lib/virtfleet/fleet.db"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.reconciler.poll_interval_secs, 2);
        assert_eq!(cfg.reconciler.resync_period_secs, 300);
        assert_eq!(cfg.database.path, PathBuf::from("/var/lib/virtfleet/fleet.db"));
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn load_or_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/virtfleet.toml")).unwrap();
        assert_eq!(cfg.template_sync.task_poll_interval_secs, 2);
    }
}
