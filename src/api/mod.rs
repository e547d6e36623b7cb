//! Typed façade over one cluster's hypervisor HTTP API.
//!
//! Stateless per cluster: construct a [`ClusterClient`] from a cluster
//! record, call typed methods, get typed wire records back. Every response
//! arrives wrapped in a `{"data": ...}` envelope and every numeric field is
//! treated as untrusted (number or string, possibly missing).

mod client;
mod types;

pub use client::ClusterClient;
pub use types::{
    ClusterResource, ClusterStatusItem, NodeItem, QemuItem, StorageItem, TaskEntry, TaskStatus,
    VmConfig,
};

use thiserror::Error;

/// Errors from the remote hypervisor API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The cluster record cannot produce a usable client.
    #[error("cluster configuration invalid: {0}")]
    Config(String),

    /// Connection-level failure (DNS, TLS, timeout, reset).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-2xx response.
    #[error("{url} returned HTTP {status}: {body}")]
    Status { status: u16, url: String, body: String },

    /// Body did not match the expected shape.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// The envelope carried no data where data was required.
    #[error("{url} returned an empty data payload")]
    EmptyData { url: String },

    /// A long-running remote task finished with a non-OK exit status.
    #[error("remote task {upid} failed: {exit}")]
    TaskFailed { upid: String, exit: String },

    /// A long-running remote task outlived its per-step bound.
    #[error("remote task {upid} did not finish within {secs}s")]
    TaskTimeout { upid: String, secs: u64 },
}

impl ApiError {
    /// True for failures the reflector should simply retry on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::TaskTimeout { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
