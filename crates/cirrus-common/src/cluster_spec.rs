use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Environment tier of a managed cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    Production,
    Prestable,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "PRODUCTION"),
            Environment::Prestable => write!(f, "PRESTABLE"),
        }
    }
}

/// Redis server parameters.
///
/// On the desired side an absent optional field means "keep whatever the
/// control plane has"; only fields that are set take part in diffing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedisConfig {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmemory_policy: Option<String>,

    /// Idle client timeout, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_keyspace_events: Option<String>,

    /// Microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowlog_log_slower_than: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowlog_max_len: Option<i64>,

    /// Number of logical databases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<i64>,
}

/// Compute/storage shape shared by every host of the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub resource_preset_id: String,
    pub disk_size_gb: u64,

    /// Absent on the desired side means "control plane default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeekDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceWindow {
    #[default]
    Anytime,
    Weekly {
        day: WeekDay,
        /// 1..=24, UTC.
        hour: u8,
    },
}

/// One desired host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSpec {
    pub zone: String,
    pub subnet_id: String,

    /// None means the unsharded (sentinel) topology.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_name: Option<String>,

    /// Explicit identity of an existing host; pins the match instead of
    /// relying on positional matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
}

impl HostSpec {
    pub fn new(zone: impl Into<String>, subnet_id: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            subnet_id: subnet_id.into(),
            shard_name: None,
            fqdn: None,
        }
    }

    pub fn in_shard(mut self, shard_name: impl Into<String>) -> Self {
        self.shard_name = Some(shard_name.into());
        self
    }

    /// Shard key used for partitioning; the empty string stands for "unsharded".
    pub fn shard_key(&self) -> &str {
        self.shard_name.as_deref().unwrap_or("")
    }
}

/// Declares how a Redis cluster should look. Produced by the configuration
/// layer, fully validated before it reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    pub folder_id: String,

    #[serde(default)]
    pub description: String,

    pub environment: Environment,

    /// Immutable after creation.
    pub network_id: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub security_group_ids: BTreeSet<String>,

    /// Immutable after creation.
    #[serde(default)]
    pub tls_enabled: bool,

    pub config: RedisConfig,
    pub resources: Resources,

    #[serde(default)]
    pub maintenance_window: MaintenanceWindow,

    #[serde(default)]
    pub deletion_protection: bool,

    /// Immutable after creation.
    #[serde(default)]
    pub sharded: bool,

    pub hosts: Vec<HostSpec>,
}

impl ClusterSpec {
    /// Distinct shard keys in order of first appearance.
    pub fn shard_names(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for host in &self.hosts {
            let key = host.shard_key();
            if !out.contains(&key) {
                out.push(key);
            }
        }
        out
    }
}
