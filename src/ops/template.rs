//! Template import from an uploaded archive.

use crate::api::ClusterClient;
use crate::config::TemplateSyncConfig;
use crate::db::{ClusterRepo, Database, NodeRepo, TemplateRepo, VmRepo};
use crate::model::{InstanceStatus, TemplateInstance, UploadStatus, Vm};

pub struct TemplateOps {
    templates: TemplateRepo,
    nodes: NodeRepo,
    vms: VmRepo,
    clusters: ClusterRepo,
    config: TemplateSyncConfig,
}

impl TemplateOps {
    pub fn new(db: Database, config: TemplateSyncConfig) -> Self {
        Self {
            templates: TemplateRepo::new(db.clone()),
            nodes: NodeRepo::new(db.clone()),
            vms: VmRepo::new(db.clone()),
            clusters: ClusterRepo::new(db),
            config,
        }
    }

    /// Materialise a template's primary instance from an uploaded archive:
    /// create the VM from the archive on `node_name`, convert it to a
    /// template, and record the primary instance plus its VM row.
    ///
    /// Returns the new primary instance id.
    pub async fn import_from_upload(&self, upload_id: i64, node_name: &str) -> anyhow::Result<i64> {
        let upload = self
            .templates
            .get_upload(upload_id)?
            .ok_or_else(|| anyhow::anyhow!("upload {upload_id} not found"))?;
        anyhow::ensure!(
            upload.status == UploadStatus::Uploaded,
            "upload {upload_id} is {}, only uploaded archives can be imported",
            upload.status.as_str()
        );
        let template = self
            .templates
            .get(upload.template_id)?
            .ok_or_else(|| anyhow::anyhow!("template {} not found", upload.template_id))?;
        anyhow::ensure!(
            self.templates.primary_instance(template.id)?.is_none(),
            "template {:?} already has a primary instance",
            template.name
        );
        let node = self
            .nodes
            .get_by_name(template.cluster_id, node_name)?
            .ok_or_else(|| anyhow::anyhow!("node {node_name} not observed yet"))?;
        let cluster = self
            .clusters
            .get(template.cluster_id)?
            .ok_or_else(|| anyhow::anyhow!("cluster {} not found", template.cluster_id))?;
        let client = ClusterClient::new(&cluster)?;

        let vmid = client.next_vmid().await?;
        anyhow::ensure!(vmid != 0, "remote allocated vmid 0");

        let upid = client
            .create_from_archive(
                &node.name,
                vmid,
                &upload.file_path,
                &upload.storage_name,
                &template.name,
            )
            .await?;
        client
            .wait_for_task(
                &node.name,
                &upid,
                self.config.clone_timeout(),
                self.config.task_poll_interval(),
                || {},
            )
            .await?;

        if let Some(upid) = client.convert_to_template(&node.name, vmid).await? {
            client
                .wait_for_task(
                    &node.name,
                    &upid,
                    self.config.clone_timeout(),
                    self.config.task_poll_interval(),
                    || {},
                )
                .await?;
        }

        let mut instance = TemplateInstance {
            id: 0,
            template_id: template.id,
            upload_id: Some(upload.id),
            cluster_id: template.cluster_id,
            node_id: node.id,
            node_name: node.name.clone(),
            storage_name: upload.storage_name.clone(),
            is_shared: false,
            vmid: Some(vmid),
            status: InstanceStatus::Available,
            sync_task_id: None,
            is_primary: true,
            create_time: None,
            update_time: None,
        };
        self.templates.create_instance(&mut instance)?;
        self.templates.set_upload_status(upload.id, UploadStatus::Imported)?;

        // Record the VM row eagerly so readers see the template without
        // waiting for the next resync.
        let mut vm = Vm {
            cluster_id: template.cluster_id,
            cluster_name: cluster.name.clone(),
            node_id: node.id,
            node_name: node.name.clone(),
            vmid,
            name: template.name.clone(),
            storage_name: upload.storage_name.clone(),
            is_template: true,
            template_id: Some(template.id),
            status: "stopped".into(),
            node_ip: node.ip.clone(),
            ..Default::default()
        };
        self.vms.upsert(&mut vm)?;

        tracing::info!(
            template = %template.name,
            vmid,
            node = %node.name,
            "template imported from archive"
        );
        Ok(instance.id)
    }
}
