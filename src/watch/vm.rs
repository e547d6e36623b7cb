//! VM list-watcher for one node.

use crate::api::ClusterClient;
use crate::informer::ListerWatcher;
use crate::model::{vm_filtered_out, Vm};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Lists the VMs on a single node and applies the list-time filters:
/// unstable statuses, half-created clone intermediates and transient
/// `sync-` clones never enter the delta stream.
pub struct VmListerWatcher {
    client: Arc<ClusterClient>,
    cluster_id: i64,
    cluster_name: String,
    node_name: String,
    node_ip: String,
    poll_interval: Duration,
}

impl VmListerWatcher {
    pub fn new(
        client: Arc<ClusterClient>,
        cluster_id: i64,
        cluster_name: String,
        node_name: String,
        node_ip: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            cluster_id,
            cluster_name,
            node_name,
            node_ip,
            poll_interval,
        }
    }
}

#[async_trait]
impl ListerWatcher<Vm> for VmListerWatcher {
    async fn list(&self) -> anyhow::Result<Vec<Vm>> {
        let items = self.client.list_qemu(&self.node_name).await?;

        let mut vms: Vec<Vm> = items
            .into_iter()
            .filter(|item| {
                !vm_filtered_out(
                    &item.status,
                    &item.name,
                    item.cpus,
                    item.maxmem as i64,
                    item.template,
                )
            })
            .map(|item| Vm {
                cluster_id: self.cluster_id,
                cluster_name: self.cluster_name.clone(),
                node_name: self.node_name.clone(),
                node_ip: self.node_ip.clone(),
                vmid: item.vmid,
                name: item.name,
                cpu: item.cpus,
                memory: item.maxmem as i64,
                is_template: item.template,
                status: item.status,
                ..Default::default()
            })
            .collect();
        vms.sort_by_key(|vm| vm.vmid);
        Ok(vms)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
