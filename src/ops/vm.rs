//! VM lifecycle operations.

use crate::api::ClusterClient;
use crate::db::{ClusterRepo, Database, IpAddressRepo, NodeRepo, VmRepo};
use crate::model::{Cluster, Vm};
use std::time::Duration;

/// Upper bound for a power or delete task on the remote side.
const OP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Upper bound for an operator-triggered migration.
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Remote task poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct VmOps {
    vms: VmRepo,
    nodes: NodeRepo,
    clusters: ClusterRepo,
    ips: IpAddressRepo,
}

impl VmOps {
    pub fn new(db: Database) -> Self {
        Self {
            vms: VmRepo::new(db.clone()),
            nodes: NodeRepo::new(db.clone()),
            clusters: ClusterRepo::new(db.clone()),
            ips: IpAddressRepo::new(db),
        }
    }

    fn load(&self, vm_id: i64) -> anyhow::Result<(Vm, Cluster, ClusterClient)> {
        let vm = self
            .vms
            .get(vm_id)?
            .ok_or_else(|| anyhow::anyhow!("vm {vm_id} not found"))?;
        let cluster = self
            .clusters
            .get(vm.cluster_id)?
            .ok_or_else(|| anyhow::anyhow!("cluster {} not found", vm.cluster_id))?;
        let client = ClusterClient::new(&cluster)?;
        Ok((vm, cluster, client))
    }

    /// Power on a stopped VM and record the new status.
    pub async fn start(&self, vm_id: i64) -> anyhow::Result<()> {
        let (mut vm, _cluster, client) = self.load(vm_id)?;
        anyhow::ensure!(!vm.is_template, "vm {} is a template and cannot be started", vm.vmid);
        anyhow::ensure!(
            vm.status == "stopped",
            "vm {} is {}, only stopped VMs can be started",
            vm.vmid,
            vm.status
        );

        let upid = client.start_vm(&vm.node_name, vm.vmid).await?;
        client
            .wait_for_task(&vm.node_name, &upid, OP_TIMEOUT, POLL_INTERVAL, || {})
            .await?;

        vm.status = "running".into();
        self.vms.upsert(&mut vm)?;
        tracing::info!(vmid = vm.vmid, node = %vm.node_name, "vm started");
        Ok(())
    }

    /// Hard stop a running VM and record the new status.
    pub async fn stop(&self, vm_id: i64) -> anyhow::Result<()> {
        let (mut vm, _cluster, client) = self.load(vm_id)?;
        anyhow::ensure!(
            vm.status == "running",
            "vm {} is {}, only running VMs can be stopped",
            vm.vmid,
            vm.status
        );

        let upid = client.stop_vm(&vm.node_name, vm.vmid).await?;
        client
            .wait_for_task(&vm.node_name, &upid, OP_TIMEOUT, POLL_INTERVAL, || {})
            .await?;

        vm.status = "stopped".into();
        self.vms.upsert(&mut vm)?;
        tracing::info!(vmid = vm.vmid, node = %vm.node_name, "vm stopped");
        Ok(())
    }

    /// Delete a VM on the remote side with purge, release any pool
    /// addresses bound to it, then drop the local row.
    pub async fn remove(&self, vm_id: i64) -> anyhow::Result<()> {
        let (vm, _cluster, client) = self.load(vm_id)?;
        anyhow::ensure!(
            vm.status != "running",
            "vm {} is running, stop it before deleting",
            vm.vmid
        );

        if let Some(upid) = client.delete_vm(&vm.node_name, vm.vmid).await? {
            client
                .wait_for_task(&vm.node_name, &upid, OP_TIMEOUT, POLL_INTERVAL, || {})
                .await?;
        }

        for address in self.ips.list_by_cluster(vm.cluster_id)? {
            if address.vm_id == Some(vm.id) {
                self.ips.release(address.id)?;
            }
        }
        self.vms.delete_by_id(vm.id)?;
        tracing::info!(vmid = vm.vmid, node = %vm.node_name, "vm deleted");
        Ok(())
    }

    /// Migrate a VM to another node of the same cluster and update the
    /// local placement eagerly.
    pub async fn migrate(&self, vm_id: i64, target_node: &str) -> anyhow::Result<()> {
        let (mut vm, _cluster, client) = self.load(vm_id)?;
        anyhow::ensure!(
            vm.node_name != target_node,
            "vm {} already resides on {}",
            vm.vmid,
            target_node
        );
        let target = self
            .nodes
            .get_by_name(vm.cluster_id, target_node)?
            .ok_or_else(|| anyhow::anyhow!("target node {target_node} not found"))?;
        anyhow::ensure!(
            target.is_schedulable,
            "target node {target_node} is not schedulable"
        );

        let upid = client
            .migrate_vm(&vm.node_name, vm.vmid, target_node)
            .await?;
        client
            .wait_for_task(&vm.node_name, &upid, MIGRATE_TIMEOUT, POLL_INTERVAL, || {})
            .await?;

        // The (vmid, node_id) natural key changes with placement, so the
        // old row goes away and a fresh one is written for the target.
        self.vms.delete_by_id(vm.id)?;
        vm.id = 0;
        vm.node_id = target.id;
        vm.node_name = target.name.clone();
        vm.node_ip = target.ip.clone();
        self.vms.upsert(&mut vm)?;
        tracing::info!(vmid = vm.vmid, target = %target.name, "vm migrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{sample_cluster, temp_db};
    use crate::model::{IpAddress, Node};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _tmp: tempfile::TempDir,
        db: Database,
        cluster_id: i64,
        vm_id: i64,
    }

    async fn ok_task(server: &MockServer, upid: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/nodes/n1/tasks/{upid}/status")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "stopped", "exitstatus": "OK"}
            })))
            .mount(server)
            .await;
    }

    fn fixture(server_uri: &str, status: &str) -> Fixture {
        let (tmp, db) = temp_db();
        let clusters = ClusterRepo::new(db.clone());
        let mut cluster = sample_cluster("lab", server_uri, true);
        clusters.create(&mut cluster).unwrap();

        let nodes = NodeRepo::new(db.clone());
        for (name, schedulable) in [("n1", true), ("n2", true), ("n3", false)] {
            let mut node = Node {
                cluster_id: cluster.id,
                name: name.into(),
                ip: "10.0.0.1".into(),
                status: "online".into(),
                is_schedulable: schedulable,
                ..Default::default()
            };
            nodes.upsert(&mut node).unwrap();
        }

        let node = nodes.get_by_name(cluster.id, "n1").unwrap().unwrap();
        let vms = VmRepo::new(db.clone());
        let mut vm = Vm {
            cluster_id: cluster.id,
            cluster_name: "lab".into(),
            node_id: node.id,
            node_name: "n1".into(),
            vmid: 101,
            name: "web".into(),
            cpu: 2.0,
            memory: 4_294_967_296,
            status: status.into(),
            ..Default::default()
        };
        vms.upsert(&mut vm).unwrap();

        Fixture {
            _tmp: tmp,
            db,
            cluster_id: cluster.id,
            vm_id: vm.id,
        }
    }

    #[tokio::test]
    async fn start_requires_stopped_status() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri(), "running");
        let ops = VmOps::new(fixture.db.clone());

        let err = ops.start(fixture.vm_id).await.unwrap_err();
        assert!(err.to_string().contains("only stopped VMs"), "{err}");
    }

    #[tokio::test]
    async fn start_round_trips_and_updates_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/n1/qemu/101/status/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "UPID:n1:start"})))
            .mount(&server)
            .await;
        ok_task(&server, "UPID:n1:start").await;

        let fixture = fixture(&server.uri(), "stopped");
        let ops = VmOps::new(fixture.db.clone());
        ops.start(fixture.vm_id).await.unwrap();

        let vm = VmRepo::new(fixture.db.clone())
            .get(fixture.vm_id)
            .unwrap()
            .unwrap();
        assert_eq!(vm.status, "running");
    }

    #[tokio::test]
    async fn remove_releases_pool_addresses() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/nodes/n1/qemu/101"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "UPID:n1:del"})))
            .mount(&server)
            .await;
        ok_task(&server, "UPID:n1:del").await;

        let fixture = fixture(&server.uri(), "stopped");
        let ips = IpAddressRepo::new(fixture.db.clone());
        ips.create(&mut IpAddress {
            id: 0,
            cluster_id: fixture.cluster_id,
            ip: "10.0.1.10".into(),
            vm_id: None,
            status: "free".into(),
            create_time: None,
            update_time: None,
        })
        .unwrap();
        let assigned = ips.assign_free(fixture.cluster_id, fixture.vm_id).unwrap().unwrap();

        let ops = VmOps::new(fixture.db.clone());
        ops.remove(fixture.vm_id).await.unwrap();

        assert!(VmRepo::new(fixture.db.clone())
            .get(fixture.vm_id)
            .unwrap()
            .is_none());
        let released = ips.get(assigned.id).unwrap().unwrap();
        assert_eq!(released.status, "free");
        assert_eq!(released.vm_id, None);
    }

    #[tokio::test]
    async fn remove_refuses_running_vm() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri(), "running");
        let ops = VmOps::new(fixture.db.clone());

        let err = ops.remove(fixture.vm_id).await.unwrap_err();
        assert!(err.to_string().contains("stop it before deleting"), "{err}");
    }

    #[tokio::test]
    async fn migrate_moves_placement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/n1/qemu/101/migrate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "UPID:n1:mig"})))
            .mount(&server)
            .await;
        ok_task(&server, "UPID:n1:mig").await;

        let fixture = fixture(&server.uri(), "stopped");
        let ops = VmOps::new(fixture.db.clone());
        ops.migrate(fixture.vm_id, "n2").await.unwrap();

        let vms = VmRepo::new(fixture.db.clone());
        let moved = vms
            .get_by_vmid_and_node_name(fixture.cluster_id, 101, "n2")
            .unwrap()
            .expect("vm row follows placement");
        assert_eq!(moved.node_name, "n2");
        assert!(vms
            .get_by_vmid_and_node_name(fixture.cluster_id, 101, "n1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn migrate_validates_target() {
        let server = MockServer::start().await;
        let fixture = fixture(&server.uri(), "stopped");
        let ops = VmOps::new(fixture.db.clone());

        let err = ops.migrate(fixture.vm_id, "n1").await.unwrap_err();
        assert!(err.to_string().contains("already resides"), "{err}");

        let err = ops.migrate(fixture.vm_id, "ghost").await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");

        let err = ops.migrate(fixture.vm_id, "n3").await.unwrap_err();
        assert!(err.to_string().contains("not schedulable"), "{err}");
    }
}
