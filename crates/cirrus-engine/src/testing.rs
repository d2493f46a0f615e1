//! Fixtures and a local step simulator for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;

use cirrus_common::{
    ClusterSpec, ClusterState, ClusterStatus, Environment, HostSpec, HostState, MaintenanceWindow,
    RedisConfig, Resources, ShardState,
};

use crate::change::{ChangeSet, ChangeStep};

pub fn make_spec(hosts: Vec<HostSpec>) -> ClusterSpec {
    let sharded = hosts.iter().any(|h| h.shard_name.is_some());
    ClusterSpec {
        name: "test-redis".into(),
        folder_id: "b1gfolder".into(),
        description: "Redis Cluster Test".into(),
        environment: Environment::Prestable,
        network_id: "enpnet".into(),
        labels: BTreeMap::from([("test_key".to_string(), "test_value".to_string())]),
        security_group_ids: BTreeSet::from(["sg-1".to_string()]),
        tls_enabled: false,
        config: RedisConfig {
            version: "6.2".into(),
            maxmemory_policy: Some("ALLKEYS_LRU".into()),
            timeout: Some(100),
            notify_keyspace_events: Some("Elg".into()),
            slowlog_log_slower_than: Some(5000),
            slowlog_max_len: Some(10),
            databases: Some(15),
        },
        resources: Resources {
            resource_preset_id: "hm1.nano".into(),
            disk_size_gb: 16,
            disk_type_id: Some("network-ssd".into()),
        },
        maintenance_window: MaintenanceWindow::Anytime,
        deletion_protection: false,
        sharded,
        hosts,
    }
}

pub fn sharded_hosts(shards: &[&str], per_shard: usize) -> Vec<HostSpec> {
    shards
        .iter()
        .flat_map(|s| {
            (0..per_shard).map(move |_| HostSpec::new("ru-central1-c", "subnet-c").in_shard(*s))
        })
        .collect()
}

/// Observed state that exactly matches `spec`.
pub fn make_state(spec: &ClusterSpec) -> ClusterState {
    let hosts: Vec<HostState> = spec
        .hosts
        .iter()
        .enumerate()
        .map(|(i, h)| HostState {
            fqdn: format!("{}-{:04}.mdb.cloud.internal", h.zone, i + 1),
            zone: h.zone.clone(),
            subnet_id: h.subnet_id.clone(),
            shard_name: h.shard_key().to_string(),
        })
        .collect();
    let mut state = ClusterState {
        id: "c9qtest".into(),
        folder_id: spec.folder_id.clone(),
        name: spec.name.clone(),
        description: spec.description.clone(),
        environment: spec.environment,
        network_id: spec.network_id.clone(),
        labels: spec.labels.clone(),
        security_group_ids: spec.security_group_ids.clone(),
        status: ClusterStatus::Running,
        tls_enabled: spec.tls_enabled,
        sharded: spec.sharded,
        config: spec.config.clone(),
        resources: spec.resources.clone(),
        maintenance_window: spec.maintenance_window.clone(),
        deletion_protection: spec.deletion_protection,
        hosts,
        shards: Vec::new(),
        created_at: Utc::now(),
    };
    recount_shards(&mut state);
    state
}

fn recount_shards(state: &mut ClusterState) {
    if !state.sharded {
        state.shards.clear();
        return;
    }
    let mut names: Vec<String> = state.shards.iter().map(|s| s.name.clone()).collect();
    for h in &state.hosts {
        if !names.contains(&h.shard_name) {
            names.push(h.shard_name.clone());
        }
    }
    state.shards = names
        .into_iter()
        .map(|name| {
            let host_count = state.hosts.iter().filter(|h| h.shard_name == name).count();
            ShardState { name, host_count }
        })
        .collect();
}

static HOST_SEQ: AtomicU32 = AtomicU32::new(0);

/// Apply `step` to `state` the way a well-behaved control plane would.
/// New hosts get `simNNNN` names.
pub fn apply(state: &mut ClusterState, step: &ChangeStep) {
    let new_host = |host: &HostSpec, shard: &str| {
        let seq = HOST_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        HostState {
            fqdn: format!("{}-sim{:04}.mdb.cloud.internal", host.zone, seq),
            zone: host.zone.clone(),
            subnet_id: host.subnet_id.clone(),
            shard_name: shard.to_string(),
        }
    };
    match step {
        ChangeStep::AddShard {
            shard_name, host, ..
        } => {
            let h = new_host(host, shard_name);
            state.hosts.push(h);
        }
        ChangeStep::AddHost { host, .. } => {
            let h = new_host(host, host.shard_key());
            state.hosts.push(h);
        }
        ChangeStep::RemoveHost { fqdn, .. } => state.hosts.retain(|h| &h.fqdn != fqdn),
        ChangeStep::RemoveShard { shard_name, .. } => {
            state.shards.retain(|s| &s.name != shard_name);
            state.hosts.retain(|h| &h.shard_name != shard_name);
        }
        ChangeStep::CreateCluster { .. } | ChangeStep::DeleteCluster { .. } => {}
        other => {
            let Some(req) = other.update_request(&state.id) else {
                return;
            };
            if let Some(v) = req.description {
                state.description = v;
            }
            if let Some(v) = req.labels {
                state.labels = v;
            }
            if let Some(v) = req.security_group_ids {
                state.security_group_ids = v;
            }
            if let Some(v) = req.environment {
                state.environment = v;
            }
            if let Some(p) = req.config {
                p.apply_to(&mut state.config);
            }
            if let Some(p) = req.resources {
                p.apply_to(&mut state.resources);
            }
            if let Some(v) = req.maintenance_window {
                state.maintenance_window = v;
            }
            if let Some(v) = req.deletion_protection {
                state.deletion_protection = v;
            }
        }
    }
    recount_shards(state);
}

pub fn apply_all(state: &mut ClusterState, changes: &ChangeSet) {
    for step in changes {
        apply(state, step);
    }
}
