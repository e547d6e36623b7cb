//! The template sync engine.
//!
//! One task = clone the primary template VM on its source node, migrate
//! the clone offline to the target node, convert it to a template there,
//! then reconcile persistence so readers see the new template before the
//! next reflector resync.
//!
//! The engine runs on its own detached token tree, so the request that
//! created a task can complete while the long-running job proceeds.

use crate::api::ClusterClient;
use crate::config::TemplateSyncConfig;
use crate::db::{ClusterRepo, Database, NodeRepo, SyncTaskRepo, TemplateRepo, VmRepo};
use crate::model::{InstanceStatus, SyncTaskStatus, TemplateSyncTask, Vm};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TemplateSyncEngine {
    tasks: SyncTaskRepo,
    templates: TemplateRepo,
    nodes: NodeRepo,
    vms: VmRepo,
    clusters: ClusterRepo,
    config: TemplateSyncConfig,
    queue_tx: mpsc::Sender<i64>,
    queue_rx: Mutex<Option<mpsc::Receiver<i64>>>,
    /// Per-template locks, created lazily and never dropped; templates
    /// are few and the lock is two words.
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    token: CancellationToken,
}

impl TemplateSyncEngine {
    pub fn new(db: Database, config: TemplateSyncConfig, parent: &CancellationToken) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            tasks: SyncTaskRepo::new(db.clone()),
            templates: TemplateRepo::new(db.clone()),
            nodes: NodeRepo::new(db.clone()),
            vms: VmRepo::new(db.clone()),
            clusters: ClusterRepo::new(db),
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            locks: Mutex::new(HashMap::new()),
            token: parent.child_token(),
        })
    }

    /// Spawn the single consumer. Tasks execute strictly in queue order.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.consume().await })
    }

    async fn consume(self: Arc<Self>) {
        let mut rx = self
            .queue_rx
            .lock()
            .take()
            .expect("sync consumer started twice");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                next = rx.recv() => {
                    let Some(task_id) = next else { break };
                    self.publish_queue_depth();
                    self.execute(task_id).await;
                }
            }
        }
    }

    // ── Producer side ───────────────────────────────────────────

    /// Create and enqueue a task that propagates `template_id`'s primary
    /// instance to `target_node`.
    pub fn request_sync(
        &self,
        template_id: i64,
        target_node: &str,
        storage_name: &str,
    ) -> anyhow::Result<i64> {
        let template = self
            .templates
            .get(template_id)?
            .ok_or_else(|| anyhow::anyhow!("template {template_id} not found"))?;
        let primary = self
            .templates
            .primary_instance(template_id)?
            .ok_or_else(|| {
                anyhow::anyhow!("template {:?} has no primary instance", template.name)
            })?;

        // File details come from the upload record when the template
        // originated from an archive.
        let (upload_id, file_path, file_size) = match primary.upload_id {
            Some(id) => match self.templates.get_upload(id)? {
                Some(upload) => (Some(id), upload.file_path, upload.file_size),
                None => (None, String::new(), 0),
            },
            None => (None, String::new(), 0),
        };

        let mut task = TemplateSyncTask {
            id: 0,
            template_id,
            upload_id,
            cluster_id: template.cluster_id,
            source_node: primary.node_name.clone(),
            target_node: target_node.to_string(),
            storage_name: storage_name.to_string(),
            file_path,
            file_size,
            status: SyncTaskStatus::Pending,
            progress: 0,
            sync_start_time: None,
            sync_end_time: None,
            error_message: String::new(),
            create_time: None,
            update_time: None,
        };
        self.tasks.create(&mut task)?;

        if let Some(instance) = self.templates.instance_for_target(template_id, target_node)? {
            self.templates.set_instance_sync_task(instance.id, task.id)?;
        }

        self.enqueue(task.id);
        Ok(task.id)
    }

    /// Queue a task id. A full queue never drops work: the send moves to a
    /// background task that blocks until a slot frees up.
    pub fn enqueue(&self, task_id: i64) {
        match self.queue_tx.try_send(task_id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task_id)) => {
                tracing::warn!(task_id, "sync queue full, completing enqueue in background");
                let tx = self.queue_tx.clone();
                tokio::spawn(async move {
                    if tx.send(task_id).await.is_err() {
                        tracing::warn!(task_id, "sync queue closed before enqueue completed");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(task_id, "sync queue closed, not enqueueing");
            }
        }
        self.publish_queue_depth();
    }

    /// Operator retry: converts a failed task back to pending and
    /// re-enqueues it. Anything else is a validation error for the caller.
    pub fn retry(&self, task_id: i64) -> anyhow::Result<()> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or_else(|| anyhow::anyhow!("sync task {task_id} not found"))?;
        if !self.tasks.reset_for_retry(task_id)? {
            anyhow::bail!(
                "sync task {task_id} is {}, only failed tasks can be retried",
                task.status.as_str()
            );
        }
        self.enqueue(task_id);
        Ok(())
    }

    fn publish_queue_depth(&self) {
        let used = self
            .config
            .queue_capacity
            .saturating_sub(self.queue_tx.capacity());
        crate::metrics::metrics().sync_queue_depth.set(used as i64);
    }

    // ── Consumer side ───────────────────────────────────────────

    fn template_lock(&self, template_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(template_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn execute(&self, task_id: i64) {
        // Re-read: a retried or manually edited task may have moved on.
        let task = match self.tasks.get(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(task_id, "sync task vanished before execution");
                return;
            }
            Err(e) => {
                tracing::warn!(task_id, "cannot load sync task: {e:#}");
                return;
            }
        };
        if task.status != SyncTaskStatus::Pending {
            tracing::debug!(task_id, status = task.status.as_str(), "skipping non-pending task");
            return;
        }

        let lock = self.template_lock(task.template_id);
        let _guard = lock.lock().await;

        // Tracks where the intermediate clone currently lives so a failure
        // at any step can delete it.
        let mut intermediate: Option<(String, u32)> = None;

        match self.run_task(&task, &mut intermediate).await {
            Ok(()) => {
                if let Err(e) = self.tasks.mark_completed(task.id) {
                    tracing::warn!(task = task.id, "failed to persist completion: {e:#}");
                }
                tracing::info!(
                    task = task.id,
                    template = task.template_id,
                    target = %task.target_node,
                    "template sync completed"
                );
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(task = task.id, "template sync failed: {message}");
                if let Err(persist_err) = self.tasks.mark_failed(task.id, &message) {
                    tracing::warn!(task = task.id, "failed to persist failure: {persist_err:#}");
                }
                if let Ok(Some(instance)) = self
                    .templates
                    .instance_for_target(task.template_id, &task.target_node)
                {
                    let _ = self
                        .templates
                        .set_instance_status(instance.id, InstanceStatus::Failed);
                }
                if let Some((node, vmid)) = intermediate {
                    self.cleanup_intermediate(&task, &node, vmid).await;
                }
            }
        }
    }

    async fn run_task(
        &self,
        task: &TemplateSyncTask,
        intermediate: &mut Option<(String, u32)>,
    ) -> anyhow::Result<()> {
        let template = self
            .templates
            .get(task.template_id)?
            .ok_or_else(|| anyhow::anyhow!("template {} no longer exists", task.template_id))?;
        let primary = self
            .templates
            .primary_instance(task.template_id)?
            .ok_or_else(|| {
                anyhow::anyhow!("template {:?} has no primary instance", template.name)
            })?;
        let primary_vmid = primary
            .vmid
            .filter(|vmid| *vmid != 0)
            .ok_or_else(|| {
                anyhow::anyhow!("primary instance of template {:?} has no vmid", template.name)
            })?;

        let cluster = self
            .clusters
            .get(task.cluster_id)?
            .ok_or_else(|| anyhow::anyhow!("cluster {} no longer exists", task.cluster_id))?;
        let client = ClusterClient::new(&cluster)?;

        let new_vmid = client.next_vmid().await?;
        anyhow::ensure!(new_vmid != 0, "remote allocated vmid 0");

        // Clone on the source node. The name prefix keeps the clone out of
        // the reconciler until conversion flips is_template.
        self.tasks.mark_started(task.id, 10)?;
        let clone_name = format!("sync-{}-{}", template.name, task.id);
        let upid = client
            .clone_vm(&task.source_node, primary_vmid, new_vmid, &clone_name)
            .await?;
        *intermediate = Some((task.source_node.clone(), new_vmid));
        self.wait_with_progress(
            &client,
            &task.source_node,
            &upid,
            task.id,
            10,
            50,
            self.config.clone_timeout(),
        )
        .await?;

        // Migrate offline to the target node.
        self.tasks.mark_importing(task.id, 50)?;
        let upid = client
            .migrate_vm(&task.source_node, new_vmid, &task.target_node)
            .await?;
        self.wait_with_progress(
            &client,
            &task.source_node,
            &upid,
            task.id,
            50,
            90,
            self.config.migrate_timeout(),
        )
        .await?;
        *intermediate = Some((task.target_node.clone(), new_vmid));

        // Convert in place on the target node.
        if let Some(upid) = client.convert_to_template(&task.target_node, new_vmid).await? {
            client
                .wait_for_task(
                    &task.target_node,
                    &upid,
                    self.config.clone_timeout(),
                    self.config.task_poll_interval(),
                    || {},
                )
                .await?;
        }

        // Reconcile persistence ahead of the next reflector resync: drop
        // any stale plain-VM row for the clone, then record the template
        // row the remote now reports.
        let target_node = self.nodes.get_by_name(task.cluster_id, &task.target_node)?;
        if let Some(ref node) = target_node {
            if self.vms.delete_stale_non_template(new_vmid, node.id)? {
                tracing::debug!(vmid = new_vmid, node = %node.name, "removed stale clone row");
            }
        }
        let remote_config = client.vm_config(&task.target_node, new_vmid).await?;
        if remote_config.template {
            if let Some(ref node) = target_node {
                let mut vm = Vm {
                    cluster_id: task.cluster_id,
                    cluster_name: cluster.name.clone(),
                    node_id: node.id,
                    node_name: node.name.clone(),
                    vmid: new_vmid,
                    name: remote_config.name.clone().unwrap_or_else(|| clone_name.clone()),
                    cpu: remote_config.cores,
                    memory: (remote_config.memory as i64) * 1024 * 1024,
                    storage_name: task.storage_name.clone(),
                    is_template: true,
                    template_id: Some(task.template_id),
                    status: "stopped".into(),
                    node_ip: node.ip.clone(),
                    ..Default::default()
                };
                self.vms.upsert(&mut vm)?;
            }
        }

        if let Some(instance) = self
            .templates
            .instance_for_target(task.template_id, &task.target_node)?
        {
            self.templates.mark_instance_available(instance.id, new_vmid)?;
        }

        // The clone is the deliverable now; nothing left to clean up.
        *intermediate = None;
        Ok(())
    }

    /// Poll a remote task to completion, walking the persisted progress
    /// from `start` towards `end` while it runs.
    #[allow(clippy::too_many_arguments)]
    async fn wait_with_progress(
        &self,
        client: &ClusterClient,
        node: &str,
        upid: &str,
        task_id: i64,
        start: i64,
        end: i64,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let repo = self.tasks.clone();
        let mut progress = start;
        client
            .wait_for_task(node, upid, timeout, self.config.task_poll_interval(), || {
                progress = (progress + 2).min(end - 1);
                if let Err(e) = repo.update_progress(task_id, progress) {
                    tracing::debug!(task_id, "progress update failed: {e:#}");
                }
            })
            .await?;
        repo.update_progress(task_id, end)?;
        Ok(())
    }

    /// Best effort: remove a partially created clone after a failure.
    async fn cleanup_intermediate(&self, task: &TemplateSyncTask, node: &str, vmid: u32) {
        tracing::info!(
            task = task.id,
            vmid,
            node = %node,
            "deleting intermediate vm after failure"
        );
        let client = match self
            .clusters
            .get(task.cluster_id)
            .ok()
            .flatten()
            .and_then(|cluster| ClusterClient::new(&cluster).ok())
        {
            Some(client) => client,
            None => {
                tracing::warn!(task = task.id, "cannot build client for cleanup");
                return;
            }
        };
        if let Err(e) = client.delete_vm(node, vmid).await {
            tracing::warn!(task = task.id, vmid, "intermediate cleanup failed: {e}");
        }
    }
}
