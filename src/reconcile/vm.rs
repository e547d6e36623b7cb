//! VM reconciler.

use crate::db::{NodeRepo, VmRepo};
use crate::informer::EventHandler;
use crate::model::{vm_filtered_out, Vm};
use async_trait::async_trait;

pub struct VmReconciler {
    vms: VmRepo,
    nodes: NodeRepo,
    cluster_id: i64,
    cluster_name: String,
}

impl VmReconciler {
    pub fn new(vms: VmRepo, nodes: NodeRepo, cluster_id: i64, cluster_name: String) -> Self {
        Self {
            vms,
            nodes,
            cluster_id,
            cluster_name,
        }
    }

    fn apply(&self, obj: &Vm, preserve_creator: bool) -> anyhow::Result<()> {
        // The list-time filter already ran; re-check here so a handler can
        // never persist an unstable or transient record regardless of how
        // the delta reached it.
        if vm_filtered_out(&obj.status, &obj.name, obj.cpu, obj.memory, obj.is_template) {
            tracing::debug!(vmid = obj.vmid, status = %obj.status, "vm filtered, skipping");
            return Ok(());
        }
        if obj.vmid == 0 {
            tracing::debug!(name = %obj.name, "vm without vmid, skipping");
            return Ok(());
        }

        let mut vm = obj.clone();
        vm.cluster_id = self.cluster_id;
        vm.cluster_name = self.cluster_name.clone();

        if vm.node_id == 0 {
            if vm.node_name.is_empty() {
                tracing::warn!(vmid = vm.vmid, "vm carries neither node id nor node name, dropping");
                return Ok(());
            }
            match self.nodes.get_by_name(self.cluster_id, &vm.node_name)? {
                Some(node) => {
                    vm.node_id = node.id;
                    if vm.node_ip.is_empty() {
                        vm.node_ip = node.ip;
                    }
                }
                None => {
                    // Stale reference: the node itself will be observed
                    // eventually and a resync re-emits this VM.
                    tracing::warn!(
                        vmid = vm.vmid,
                        node = %vm.node_name,
                        "node not yet observed, dropping vm event"
                    );
                    return Ok(());
                }
            }
        }

        if preserve_creator {
            if let Some(stored) = self.vms.get_by_vmid_and_node_id(vm.vmid, vm.node_id)? {
                vm.creator = stored.creator;
            }
        }

        let outcome = self.vms.upsert(&mut vm)?;
        tracing::debug!(vmid = vm.vmid, outcome = outcome.as_str(), "vm reconciled");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Vm> for VmReconciler {
    async fn on_add(&self, obj: &Vm) -> anyhow::Result<()> {
        self.apply(obj, false)
    }

    async fn on_update(&self, _old: &Vm, new: &Vm) -> anyhow::Result<()> {
        self.apply(new, true)
    }

    async fn on_delete(&self, obj: &Vm) -> anyhow::Result<()> {
        // Deletion events carry the hypervisor-native reference; resolve
        // the surrogate id first. An unknown VM makes this a no-op.
        let Some(existing) =
            self.vms
                .get_by_vmid_and_node_name(self.cluster_id, obj.vmid, &obj.node_name)?
        else {
            return Ok(());
        };
        self.vms.delete_by_id(existing.id)?;
        tracing::info!(vmid = obj.vmid, node = %obj.node_name, "vm removed");
        Ok(())
    }
}
