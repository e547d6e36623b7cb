//! HTTP client for one cluster.

use super::types::{
    ClusterResource, ClusterStatusItem, Envelope, NodeItem, QemuItem, Scalar, StorageItem,
    TaskEntry, TaskStatus, VmConfig,
};
use super::ApiError;
use crate::model::Cluster;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Per-request timeout. Long-running operations return a task handle
/// immediately; nothing legitimately streams for longer than this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Stateless client for a single cluster's API endpoint.
///
/// Cheap to construct; holds no connection state beyond reqwest's pool.
pub struct ClusterClient {
    base: String,
    auth: String,
    http: reqwest::Client,
}

impl ClusterClient {
    /// Build a client from a cluster record.
    ///
    /// Cluster endpoints routinely run self-signed certificates, so
    /// certificate verification is disabled for this internal plane.
    pub fn new(cluster: &Cluster) -> Result<Self, ApiError> {
        let base = cluster.api_url.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(ApiError::Config(format!(
                "cluster {:?} has no api_url",
                cluster.name
            )));
        }
        if cluster.credential_id.trim().is_empty() {
            return Err(ApiError::Config(format!(
                "cluster {:?} has no credential principal",
                cluster.name
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base,
            auth: format!(
                "PVEAPIToken={}={}",
                cluster.credential_id, cluster.credential_secret
            ),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Option<T>, ApiError> {
        let url = self.url(path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", &self.auth);
        if let Some(form) = form {
            req = req.form(form);
        }

        let resp = req.send().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode { url, source })?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(reqwest::Method::GET, path, None)
            .await?
            .ok_or_else(|| ApiError::EmptyData {
                url: self.url(path),
            })
    }

    /// POST returning the remote task id (UPID) when the operation is
    /// asynchronous on the remote side.
    async fn post_task(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<Option<String>, ApiError> {
        self.request(reqwest::Method::POST, path, Some(form)).await
    }

    // ── Listings ────────────────────────────────────────────────

    pub async fn list_nodes(&self) -> Result<Vec<NodeItem>, ApiError> {
        self.get("/nodes").await
    }

    pub async fn cluster_status(&self) -> Result<Vec<ClusterStatusItem>, ApiError> {
        self.get("/cluster/status").await
    }

    pub async fn list_qemu(&self, node: &str) -> Result<Vec<QemuItem>, ApiError> {
        self.get(&format!("/nodes/{node}/qemu")).await
    }

    pub async fn list_storages(&self, node: &str) -> Result<Vec<StorageItem>, ApiError> {
        self.get(&format!("/nodes/{node}/storage")).await
    }

    pub async fn cluster_resources(&self) -> Result<Vec<ClusterResource>, ApiError> {
        self.get("/cluster/resources").await
    }

    pub async fn cluster_tasks(&self) -> Result<Vec<TaskEntry>, ApiError> {
        self.get("/cluster/tasks").await
    }

    pub async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, ApiError> {
        self.get(&format!("/nodes/{node}/tasks/{upid}/status")).await
    }

    pub async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, ApiError> {
        self.get(&format!("/nodes/{node}/qemu/{vmid}/config")).await
    }

    /// Next free hypervisor-native VM id. The remote reports it as a
    /// string.
    pub async fn next_vmid(&self) -> Result<u32, ApiError> {
        let raw: Scalar = self.get("/cluster/nextid").await?;
        Ok(u32::try_from(raw.as_u64()).unwrap_or(0))
    }

    // ── Imperative VM operations ────────────────────────────────

    /// Full clone of `vmid` into `newid` on the same node.
    pub async fn clone_vm(
        &self,
        node: &str,
        vmid: u32,
        newid: u32,
        name: &str,
    ) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/clone");
        let form = [
            ("newid", newid.to_string()),
            ("name", name.to_string()),
            ("full", "1".to_string()),
        ];
        self.post_task(&path, &form)
            .await?
            .ok_or(ApiError::EmptyData {
                url: self.url(&path),
            })
    }

    /// Offline migration of `vmid` to `target`.
    pub async fn migrate_vm(
        &self,
        node: &str,
        vmid: u32,
        target: &str,
    ) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/migrate");
        let form = [("target", target.to_string())];
        self.post_task(&path, &form)
            .await?
            .ok_or(ApiError::EmptyData {
                url: self.url(&path),
            })
    }

    /// Delete a VM together with its disks and references.
    pub async fn delete_vm(&self, node: &str, vmid: u32) -> Result<Option<String>, ApiError> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/nodes/{node}/qemu/{vmid}?purge=1"),
            None,
        )
        .await
    }

    /// Convert a stopped VM into a template in place.
    pub async fn convert_to_template(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Option<String>, ApiError> {
        self.post_task(&format!("/nodes/{node}/qemu/{vmid}/template"), &[])
            .await
    }

    /// Power on a stopped VM.
    pub async fn start_vm(&self, node: &str, vmid: u32) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/start");
        self.post_task(&path, &[])
            .await?
            .ok_or(ApiError::EmptyData {
                url: self.url(&path),
            })
    }

    /// Hard stop a running VM.
    pub async fn stop_vm(&self, node: &str, vmid: u32) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/stop");
        self.post_task(&path, &[])
            .await?
            .ok_or(ApiError::EmptyData {
                url: self.url(&path),
            })
    }

    /// Create a VM from an uploaded archive.
    pub async fn create_from_archive(
        &self,
        node: &str,
        vmid: u32,
        archive: &str,
        storage: &str,
        name: &str,
    ) -> Result<String, ApiError> {
        let path = format!("/nodes/{node}/qemu");
        let form = [
            ("vmid", vmid.to_string()),
            ("archive", archive.to_string()),
            ("storage", storage.to_string()),
            ("name", name.to_string()),
        ];
        self.post_task(&path, &form)
            .await?
            .ok_or(ApiError::EmptyData {
                url: self.url(&path),
            })
    }

    // ── Task polling ────────────────────────────────────────────

    /// Poll a remote task until it finishes, invoking `on_poll` between
    /// polls so callers can advance a progress indicator.
    pub async fn wait_for_task(
        &self,
        node: &str,
        upid: &str,
        timeout: Duration,
        poll_interval: Duration,
        mut on_poll: impl FnMut(),
    ) -> Result<(), ApiError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.task_status(node, upid).await?;
            if !status.is_running() {
                if status.succeeded() {
                    return Ok(());
                }
                return Err(ApiError::TaskFailed {
                    upid: upid.to_string(),
                    exit: status.exit_message(),
                });
            }
            if Instant::now() >= deadline {
                return Err(ApiError::TaskTimeout {
                    upid: upid.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            on_poll();
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_cluster(api_url: &str) -> Cluster {
        Cluster {
            id: 1,
            name: "lab".into(),
            alias: "lab".into(),
            api_url: api_url.into(),
            credential_id: "svc@pam!inventory".into(),
            credential_secret: "secret".into(),
            env: "dev".into(),
            region: "eu".into(),
            datacenter: "dc1".into(),
            is_schedulable: true,
            is_enabled: true,
            create_time: None,
            update_time: None,
        }
    }

    #[test]
    fn rejects_cluster_without_url() {
        let mut cluster = test_cluster("");
        cluster.api_url = "   ".into();
        assert!(matches!(
            ClusterClient::new(&cluster),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn trailing_slash_is_normalised() {
        let client = ClusterClient::new(&test_cluster("https://pve.example:8006/api2/json/")).unwrap();
        assert_eq!(
            client.url("/nodes"),
            "https://pve.example:8006/api2/json/nodes"
        );
    }

    #[tokio::test]
    async fn list_nodes_decodes_lenient_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"node": "n1", "status": "online", "maxcpu": "16", "maxmem": 68719476736u64},
                    {"node": "n2", "status": "offline", "uptime": null}
                ]
            })))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].maxcpu, 16.0);
        assert_eq!(nodes[1].uptime, 0);
    }

    #[tokio::test]
    async fn next_vmid_parses_string_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/nextid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "105"})))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        assert_eq!(client.next_vmid().await.unwrap(), 105);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let err = client.list_nodes().await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let err = client.list_nodes().await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn clone_returns_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nodes/n1/qemu/100/clone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": "UPID:n1:0000ABCD:12345:67890:qmclone:100:root@pam:"
            })))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let upid = client.clone_vm("n1", 100, 105, "sync-base-1").await.unwrap();
        assert!(upid.starts_with("UPID:n1:"));
    }

    #[tokio::test]
    async fn wait_for_task_reports_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/tasks/UPID:x/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "stopped", "exitstatus": "migration aborted"}
            })))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let err = client
            .wait_for_task(
                "n1",
                "UPID:x",
                Duration::from_secs(5),
                Duration::from_millis(10),
                || {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TaskFailed { .. }));
    }

    #[tokio::test]
    async fn wait_for_task_polls_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/tasks/UPID:y/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "running"}
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodes/n1/tasks/UPID:y/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "stopped", "exitstatus": "OK"}
            })))
            .mount(&server)
            .await;

        let client = ClusterClient::new(&test_cluster(&server.uri())).unwrap();
        let mut polls = 0;
        client
            .wait_for_task(
                "n1",
                "UPID:y",
                Duration::from_secs(5),
                Duration::from_millis(5),
                || polls += 1,
            )
            .await
            .unwrap();
        assert_eq!(polls, 2);
    }
}
