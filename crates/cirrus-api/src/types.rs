use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cirrus_common::{
    ClusterSpec, ClusterState, ClusterStatus, Environment, HostSpec, HostState, MaintenanceWindow,
    RedisConfig, Resources, ShardState,
};

/// Canonical status codes of the control plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    DeadlineExceeded,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        f.write_str(s)
    }
}

/// Error payload returned by the control plane, either synchronously on
/// submission or inside a finished operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RemoteStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The request never got a definite answer (connection reset, DNS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Remote(#[from] RemoteStatus),
}

impl ApiError {
    pub fn remote(code: StatusCode, message: impl Into<String>) -> Self {
        ApiError::Remote(RemoteStatus::new(code, message))
    }

    /// Errors worth retrying without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Remote(s) => {
                matches!(s.code, StatusCode::Unavailable | StatusCode::DeadlineExceeded)
            }
            ApiError::Unauthenticated(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Remote(s) if s.code == StatusCode::NotFound)
    }
}

/// What a finished operation produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Response { resource_id: String },
    Error(RemoteStatus),
}

/// Handle to a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    pub description: String,
    pub cluster_id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationOutcome>,
}

/// Cluster metadata as returned by `Get`/`List`; hosts and shards come from
/// their own list calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub folder_id: String,
    pub name: String,
    pub description: String,
    pub environment: Environment,
    pub network_id: String,
    pub labels: BTreeMap<String, String>,
    pub security_group_ids: BTreeSet<String>,
    pub status: ClusterStatus,
    pub tls_enabled: bool,
    pub sharded: bool,
    pub config: RedisConfig,
    pub resources: Resources,
    pub maintenance_window: MaintenanceWindow,
    pub deletion_protection: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub cluster_id: String,
    pub zone_id: String,
    pub subnet_id: String,
    #[serde(default)]
    pub shard_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub cluster_id: String,
}

impl Cluster {
    /// Assemble the engine's view of the cluster from the three list calls.
    pub fn into_state(self, hosts: Vec<Host>, shards: Vec<Shard>) -> ClusterState {
        let shards = shards
            .into_iter()
            .map(|s| {
                let host_count = hosts.iter().filter(|h| h.shard_name == s.name).count();
                ShardState {
                    name: s.name,
                    host_count,
                }
            })
            .collect();
        let hosts = hosts
            .into_iter()
            .map(|h| HostState {
                fqdn: h.name,
                zone: h.zone_id,
                subnet_id: h.subnet_id,
                shard_name: h.shard_name,
            })
            .collect();

        ClusterState {
            id: self.id,
            folder_id: self.folder_id,
            name: self.name,
            description: self.description,
            environment: self.environment,
            network_id: self.network_id,
            labels: self.labels,
            security_group_ids: self.security_group_ids,
            status: self.status,
            tls_enabled: self.tls_enabled,
            sharded: self.sharded,
            config: self.config,
            resources: self.resources,
            maintenance_window: self.maintenance_window,
            deletion_protection: self.deletion_protection,
            hosts,
            shards,
            created_at: self.created_at,
        }
    }
}

/// Field-level patch of the Redis configuration. Only `Some` fields are sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedisConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmemory_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_keyspace_events: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowlog_log_slower_than: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowlog_max_len: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<i64>,
}

impl RedisConfigPatch {
    pub fn apply_to(&self, cfg: &mut RedisConfig) {
        if let Some(v) = &self.version {
            cfg.version = v.clone();
        }
        if let Some(v) = &self.maxmemory_policy {
            cfg.maxmemory_policy = Some(v.clone());
        }
        if let Some(v) = self.timeout {
            cfg.timeout = Some(v);
        }
        if let Some(v) = &self.notify_keyspace_events {
            cfg.notify_keyspace_events = Some(v.clone());
        }
        if let Some(v) = self.slowlog_log_slower_than {
            cfg.slowlog_log_slower_than = Some(v);
        }
        if let Some(v) = self.slowlog_max_len {
            cfg.slowlog_max_len = Some(v);
        }
        if let Some(v) = self.databases {
            cfg.databases = Some(v);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_preset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type_id: Option<String>,
}

impl ResourcesPatch {
    pub fn apply_to(&self, res: &mut Resources) {
        if let Some(v) = &self.resource_preset_id {
            res.resource_preset_id = v.clone();
        }
        if let Some(v) = self.disk_size_gb {
            res.disk_size_gb = v;
        }
        if let Some(v) = &self.disk_type_id {
            res.disk_type_id = Some(v.clone());
        }
    }
}

/// Partial cluster update. `update_mask` lists the dotted paths being changed;
/// every other field is left untouched by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateClusterRequest {
    pub cluster_id: String,
    pub update_mask: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RedisConfigPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_window: Option<MaintenanceWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_protection: Option<bool>,
}

impl UpdateClusterRequest {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Self::default()
        }
    }
}

/// Typed surface of the managed-Redis control plane. Mutating calls return an
/// operation handle to be polled through `get_operation`.
///
/// Implementations must be safe for concurrent use by independent callers.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster, ApiError>;
    async fn list_clusters(&self, folder_id: &str) -> Result<Vec<Cluster>, ApiError>;
    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<Host>, ApiError>;
    async fn list_shards(&self, cluster_id: &str) -> Result<Vec<Shard>, ApiError>;

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Operation, ApiError>;
    async fn update_cluster(&self, req: &UpdateClusterRequest) -> Result<Operation, ApiError>;
    async fn delete_cluster(&self, cluster_id: &str) -> Result<Operation, ApiError>;

    async fn add_hosts(&self, cluster_id: &str, hosts: &[HostSpec]) -> Result<Operation, ApiError>;
    async fn delete_hosts(&self, cluster_id: &str, fqdns: &[String]) -> Result<Operation, ApiError>;
    async fn add_shard(
        &self,
        cluster_id: &str,
        shard_name: &str,
        hosts: &[HostSpec],
    ) -> Result<Operation, ApiError>;
    async fn delete_shard(&self, cluster_id: &str, shard_name: &str)
        -> Result<Operation, ApiError>;

    async fn get_operation(&self, operation_id: &str) -> Result<Operation, ApiError>;
}
