//! Cluster informer supervisor.
//!
//! The supervisor owns the only mutable view of which clusters are being
//! reconciled. Every tick it loads the enabled cluster set and diffs it
//! against the running informer map: new clusters get an informer tree,
//! disabled clusters get theirs cancelled. The map lock is held for set
//! arithmetic only; client construction, task spawning and cancellation
//! all happen outside it.

use crate::api::ClusterClient;
use crate::config::ReconcilerConfig;
use crate::db::{ClusterRepo, Database, NodeRepo, StorageRepo, VmRepo};
use crate::informer::{Informer, KeyFn};
use crate::model::{Cluster, Node, StorageEntry, Vm};
use crate::reconcile::{NodeReconciler, StorageReconciler, VmReconciler};
use crate::watch::{NodeListerWatcher, StorageListerWatcher, VmListerWatcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the delayed startup path re-checks for the initial node list.
const NODE_WAIT_PROBE: Duration = Duration::from_millis(100);

// ── Cache keys ──────────────────────────────────────────────────

fn node_key(cluster_id: i64) -> KeyFn<Node> {
    Arc::new(move |node: &Node| {
        if node.name.is_empty() {
            anyhow::bail!("node has no name");
        }
        Ok(format!("{}-{}", node.name, cluster_id))
    })
}

fn vm_key(cluster_id: i64) -> KeyFn<Vm> {
    Arc::new(move |vm: &Vm| {
        if vm.node_name.is_empty() {
            anyhow::bail!("vm {} has no node name", vm.vmid);
        }
        Ok(format!("{}-{}-{}", vm.node_name, vm.vmid, cluster_id))
    })
}

fn storage_key(cluster_id: i64) -> KeyFn<StorageEntry> {
    Arc::new(move |entry: &StorageEntry| {
        if entry.storage_name.is_empty() {
            anyhow::bail!("storage on {} has no name", entry.node_name);
        }
        Ok(format!(
            "{}-{}-{}",
            entry.node_name, entry.storage_name, cluster_id
        ))
    })
}

// ── Per-cluster informer tree ───────────────────────────────────

/// Everything supervising one cluster: the node informer plus one VM and
/// one storage informer per node, all scoped to one cancellation token.
struct ClusterInformerSet {
    cluster: Cluster,
    client: Arc<ClusterClient>,
    db: Database,
    config: ReconcilerConfig,
    node_informer: Arc<Informer<Node>>,
    vm_informers: Mutex<HashMap<String, Arc<Informer<Vm>>>>,
    storage_informers: Mutex<HashMap<String, Arc<Informer<StorageEntry>>>>,
    token: CancellationToken,
}

impl ClusterInformerSet {
    /// Start the VM and storage informers for one node, bound to the
    /// cluster token.
    fn start_informers_for_node(&self, node: &Node) {
        let vm_informer = Arc::new(Informer::new(
            "vm",
            Arc::new(VmListerWatcher::new(
                self.client.clone(),
                self.cluster.id,
                self.cluster.name.clone(),
                node.name.clone(),
                node.ip.clone(),
                self.config.poll_interval(),
            )),
            vm_key(self.cluster.id),
            vec![Arc::new(VmReconciler::new(
                VmRepo::new(self.db.clone()),
                NodeRepo::new(self.db.clone()),
                self.cluster.id,
                self.cluster.name.clone(),
            ))],
            self.config.resync_period(),
            self.config.poll_interval(),
            &self.token,
        ));
        vm_informer.run();
        self.vm_informers
            .lock()
            .insert(node.name.clone(), vm_informer);

        let storage_informer = Arc::new(Informer::new(
            "storage",
            Arc::new(StorageListerWatcher::new(
                self.client.clone(),
                self.cluster.id,
                node.name.clone(),
                self.config.poll_interval(),
            )),
            storage_key(self.cluster.id),
            vec![Arc::new(StorageReconciler::new(
                StorageRepo::new(self.db.clone()),
                self.cluster.id,
            ))],
            self.config.resync_period(),
            self.config.poll_interval(),
            &self.token,
        ));
        storage_informer.run();
        self.storage_informers
            .lock()
            .insert(node.name.clone(), storage_informer);
    }

    async fn stop(&self) {
        self.token.cancel();
        self.node_informer.stop().await;

        let vm_informers: Vec<_> = self.vm_informers.lock().drain().map(|(_, i)| i).collect();
        for informer in vm_informers {
            informer.stop().await;
        }
        let storage_informers: Vec<_> = self
            .storage_informers
            .lock()
            .drain()
            .map(|(_, i)| i)
            .collect();
        for informer in storage_informers {
            informer.stop().await;
        }
    }
}

// ── Supervisor ──────────────────────────────────────────────────

pub struct ClusterSupervisor {
    db: Database,
    clusters: ClusterRepo,
    config: ReconcilerConfig,
    informers: RwLock<HashMap<i64, Arc<ClusterInformerSet>>>,
    token: CancellationToken,
}

impl ClusterSupervisor {
    pub fn new(db: Database, config: ReconcilerConfig, parent: &CancellationToken) -> Self {
        Self {
            clusters: ClusterRepo::new(db.clone()),
            db,
            config,
            informers: RwLock::new(HashMap::new()),
            token: parent.child_token(),
        }
    }

    /// Reconcile the informer map against the enabled cluster set until
    /// cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.supervisor_tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tick.tick() => self.reconcile_clusters().await,
            }
        }
        self.stop_all().await;
    }

    /// One supervision round: compute the start/stop sets under the lock,
    /// act on them outside it.
    pub async fn reconcile_clusters(&self) {
        let enabled = match self.clusters.list_enabled() {
            Ok(clusters) => clusters,
            Err(e) => {
                tracing::warn!("supervisor: failed to load enabled clusters: {e:#}");
                return;
            }
        };
        let enabled_ids: HashSet<i64> = enabled.iter().map(|c| c.id).collect();

        let (to_start, to_stop) = {
            let mut informers = self.informers.write();
            let stale_ids: Vec<i64> = informers
                .keys()
                .filter(|id| !enabled_ids.contains(id))
                .copied()
                .collect();
            let to_stop: Vec<Arc<ClusterInformerSet>> = stale_ids
                .into_iter()
                .filter_map(|id| informers.remove(&id))
                .collect();
            let to_start: Vec<Cluster> = enabled
                .into_iter()
                .filter(|c| !informers.contains_key(&c.id))
                .collect();
            (to_start, to_stop)
        };

        for set in to_stop {
            tracing::info!(cluster = %set.cluster.name, "cluster disabled, stopping informers");
            set.stop().await;
        }
        for cluster in to_start {
            self.start_cluster(cluster).await;
        }
    }

    async fn start_cluster(&self, cluster: Cluster) {
        let client = match ClusterClient::new(&cluster) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                // Retried on the next supervision tick.
                tracing::warn!(cluster = %cluster.name, "cannot build remote client: {e}");
                return;
            }
        };

        tracing::info!(cluster = %cluster.name, "starting cluster informers");
        let token = self.token.child_token();

        let node_informer = Arc::new(Informer::new(
            "node",
            Arc::new(NodeListerWatcher::new(
                client.clone(),
                cluster.id,
                cluster.env.clone(),
                self.config.poll_interval(),
            )),
            node_key(cluster.id),
            vec![Arc::new(NodeReconciler::new(
                NodeRepo::new(self.db.clone()),
                cluster.id,
            ))],
            self.config.resync_period(),
            self.config.poll_interval(),
            &token,
        ));
        node_informer.run();

        let set = Arc::new(ClusterInformerSet {
            cluster,
            client,
            db: self.db.clone(),
            config: self.config.clone(),
            node_informer,
            vm_informers: Mutex::new(HashMap::new()),
            storage_informers: Mutex::new(HashMap::new()),
            token,
        });

        // Double-check: another round may have supervised this cluster
        // while we were constructing; the just-built tree must die rather
        // than duplicate supervision.
        let duplicate = {
            let mut informers = self.informers.write();
            let duplicate = informers.contains_key(&set.cluster.id);
            if !duplicate {
                informers.insert(set.cluster.id, set.clone());
            }
            duplicate
        };
        if duplicate {
            tracing::warn!(cluster = %set.cluster.name, "cluster already supervised, discarding duplicate");
            set.stop().await;
            return;
        }

        let wait = self.config.startup_node_wait();
        let delayed = set.clone();
        tokio::spawn(async move {
            Self::start_node_informers(delayed, wait).await;
        });

        let resync = self.config.resync_period();
        tokio::spawn(async move {
            Self::capacity_loop(set, resync).await;
        });
    }

    /// Export aggregate cluster capacity from the cluster-wide resource
    /// listing, refreshed once per resync period.
    async fn capacity_loop(set: Arc<ClusterInformerSet>, period: Duration) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = set.token.cancelled() => break,
                _ = tick.tick() => {}
            }
            let resources = match set.client.cluster_resources().await {
                Ok(resources) => resources,
                Err(e) => {
                    tracing::debug!(cluster = %set.cluster.name, "capacity listing failed: {e}");
                    continue;
                }
            };
            let (mut cpu, mut memory, mut disk) = (0.0_f64, 0.0_f64, 0.0_f64);
            for resource in &resources {
                match resource.kind.as_str() {
                    "node" => {
                        cpu += resource.maxcpu;
                        memory += resource.maxmem as f64;
                    }
                    "storage" => disk += resource.maxdisk as f64,
                    _ => {}
                }
            }
            let capacity = &crate::metrics::metrics().cluster_capacity;
            capacity
                .with_label_values(&[set.cluster.name.as_str(), "cpu"])
                .set(cpu);
            capacity
                .with_label_values(&[set.cluster.name.as_str(), "memory"])
                .set(memory);
            capacity
                .with_label_values(&[set.cluster.name.as_str(), "disk"])
                .set(disk);
        }
    }

    /// Delayed startup path: give the node informer a bounded head start,
    /// then fan out per-node VM and storage informers from persistence.
    async fn start_node_informers(set: Arc<ClusterInformerSet>, wait: Duration) {
        let deadline = Instant::now() + wait;
        loop {
            if set.token.is_cancelled() {
                return;
            }
            if set.node_informer.has_synced() && !set.node_informer.store().is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = set.token.cancelled() => return,
                _ = tokio::time::sleep(NODE_WAIT_PROBE) => {}
            }
        }
        if set.token.is_cancelled() {
            return;
        }

        let nodes = match NodeRepo::new(set.db.clone()).list_by_cluster(set.cluster.id) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(cluster = %set.cluster.name, "cannot enumerate nodes: {e:#}");
                return;
            }
        };
        tracing::info!(
            cluster = %set.cluster.name,
            nodes = nodes.len(),
            "starting per-node informers"
        );
        for node in nodes {
            set.start_informers_for_node(&node);
        }
    }

    pub fn is_supervised(&self, cluster_id: i64) -> bool {
        self.informers.read().contains_key(&cluster_id)
    }

    pub fn supervised_count(&self) -> usize {
        self.informers.read().len()
    }

    async fn stop_all(&self) {
        let sets: Vec<_> = self.informers.write().drain().map(|(_, s)| s).collect();
        for set in sets {
            set.stop().await;
        }
    }

    /// Cancel the supervision tree and join every informer.
    pub async fn stop(&self) {
        self.token.cancel();
        self.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{sample_cluster, temp_db};
    use crate::db::{StorageRepo, VmRepo};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            resync_period_secs: 3600,
            poll_interval_secs: 1,
            supervisor_tick_secs: 3600,
            startup_node_wait_secs: 2,
        }
    }

    async fn mock_remote(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"node": "n1", "status": "online"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cluster/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"type": "node", "name": "n1", "ip": "10.0.0.1"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"vmid": 101, "name": "web", "status": "running",
                          "cpus": 2, "maxmem": 4294967296u64}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/storage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"storage": "local-lvm", "type": "lvmthin", "content": "images",
                          "shared": 0, "active": 1, "enabled": 1,
                          "avail": 500, "used": 100, "total": 600, "used_fraction": 0.16}]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn enablement_flip_starts_and_stops_supervision() {
        let server = MockServer::start().await;
        mock_remote(&server).await;

        let (_tmp, db) = temp_db();
        let clusters = ClusterRepo::new(db.clone());
        let mut cluster = sample_cluster("lab", &server.uri(), true);
        clusters.create(&mut cluster).unwrap();

        let root = CancellationToken::new();
        let supervisor = ClusterSupervisor::new(db, fast_config(), &root);

        supervisor.reconcile_clusters().await;
        assert!(supervisor.is_supervised(cluster.id));
        assert_eq!(supervised_after_settle(&supervisor).await, 1);

        clusters.set_enabled(cluster.id, false).unwrap();
        supervisor.reconcile_clusters().await;
        assert!(!supervisor.is_supervised(cluster.id));

        supervisor.stop().await;
    }

    async fn supervised_after_settle(supervisor: &ClusterSupervisor) -> usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.supervised_count()
    }

    #[tokio::test]
    async fn full_tree_reconciles_into_persistence() {
        let server = MockServer::start().await;
        mock_remote(&server).await;

        let (_tmp, db) = temp_db();
        let clusters = ClusterRepo::new(db.clone());
        let mut cluster = sample_cluster("lab", &server.uri(), true);
        clusters.create(&mut cluster).unwrap();

        let root = CancellationToken::new();
        let supervisor = ClusterSupervisor::new(db.clone(), fast_config(), &root);
        supervisor.reconcile_clusters().await;

        // Node informer first, then the delayed per-node fan-out.
        let nodes = NodeRepo::new(db.clone());
        let vms = VmRepo::new(db.clone());
        let storages = StorageRepo::new(db.clone());

        let mut synced = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let have_vm = vms
                .get_by_vmid_and_node_name(cluster.id, 101, "n1")
                .unwrap()
                .is_some();
            let have_storage = storages
                .get_by_natural_key(cluster.id, "n1", "local-lvm")
                .unwrap()
                .is_some();
            if have_vm && have_storage {
                synced = true;
                break;
            }
        }

        let node = nodes.get_by_name(cluster.id, "n1").unwrap().unwrap();
        assert_eq!(node.ip, "10.0.0.1");
        assert!(synced, "vm and storage informers should have reconciled");

        supervisor.stop().await;

        // Cancellation stops the whole subtree; no further writes occur.
        let before = vms
            .get_by_vmid_and_node_name(cluster.id, 101, "n1")
            .unwrap()
            .unwrap()
            .last_sync_time;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let after = vms
            .get_by_vmid_and_node_name(cluster.id, 101, "n1")
            .unwrap()
            .unwrap()
            .last_sync_time;
        assert_eq!(before, after, "no writes after cancellation");
    }

    #[tokio::test]
    async fn broken_cluster_is_skipped_and_retried() {
        let (_tmp, db) = temp_db();
        let clusters = ClusterRepo::new(db.clone());
        let mut cluster = sample_cluster("bad", "", true);
        cluster.api_url = String::new();
        clusters.create(&mut cluster).unwrap();

        let root = CancellationToken::new();
        let supervisor = ClusterSupervisor::new(db, fast_config(), &root);
        supervisor.reconcile_clusters().await;

        // Client construction failed; nothing is supervised and the next
        // round will simply try again.
        assert_eq!(supervisor.supervised_count(), 0);
        supervisor.stop().await;
    }
}
