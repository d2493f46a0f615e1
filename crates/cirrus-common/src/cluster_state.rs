use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster_spec::{Environment, MaintenanceWindow, RedisConfig, Resources};

/// Lifecycle status as reported by the control plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl ClusterStatus {
    /// True while the control plane is executing an operation on the cluster.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ClusterStatus::Creating | ClusterStatus::Updating | ClusterStatus::Stopping
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostState {
    pub fqdn: String,
    pub zone: String,
    pub subnet_id: String,
    /// Empty for unsharded clusters.
    #[serde(default)]
    pub shard_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardState {
    pub name: String,
    pub host_count: usize,
}

/// Last observed state of a cluster. Read-only input to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterState {
    pub id: String,
    pub folder_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub environment: Environment,
    pub network_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub security_group_ids: BTreeSet<String>,
    pub status: ClusterStatus,
    pub tls_enabled: bool,
    pub sharded: bool,
    pub config: RedisConfig,
    pub resources: Resources,
    pub maintenance_window: MaintenanceWindow,
    pub deletion_protection: bool,
    pub hosts: Vec<HostState>,
    pub shards: Vec<ShardState>,
    pub created_at: DateTime<Utc>,
}

impl ClusterState {
    /// Host count per shard key, counted from the host list.
    pub fn hosts_per_shard(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            out.insert(shard.name.clone(), 0);
        }
        for host in &self.hosts {
            *out.entry(host.shard_name.clone()).or_insert(0) += 1;
        }
        out
    }

    pub fn has_shard(&self, name: &str) -> bool {
        self.shards.iter().any(|s| s.name == name)
            || self.hosts.iter().any(|h| h.shard_name == name)
    }
}
