use std::collections::BTreeMap;

use cirrus_api::{RedisConfigPatch, ResourcesPatch};
use cirrus_common::{ClusterSpec, ClusterState, HostSpec, HostState};

use crate::change::{ChangeSet, ChangeStep};

/// Compute the ordered steps that take `observed` to `desired`.
///
/// Order: protection disable, host/shard additions, removals, environment,
/// metadata, config, resources, maintenance window, protection enable.
/// The output depends only on the two inputs.
pub fn diff(desired: &ClusterSpec, observed: &ClusterState) -> ChangeSet {
    let mut steps = Vec::new();

    if observed.deletion_protection && !desired.deletion_protection {
        steps.push(ChangeStep::UpdateDeletionProtection { enabled: false });
    }

    let (additions, removals) = diff_topology(desired, observed);
    steps.extend(additions);
    steps.extend(removals);

    if desired.environment != observed.environment {
        steps.push(ChangeStep::UpdateEnvironment {
            from: observed.environment,
            to: desired.environment,
        });
    }
    steps.extend(diff_metadata(desired, observed));
    steps.extend(diff_config(desired, observed));
    steps.extend(diff_resources(desired, observed));
    if desired.maintenance_window != observed.maintenance_window {
        steps.push(ChangeStep::UpdateMaintenanceWindow {
            window: desired.maintenance_window.clone(),
        });
    }

    if desired.deletion_protection && !observed.deletion_protection {
        steps.push(ChangeStep::UpdateDeletionProtection { enabled: true });
    }

    steps.into()
}

/// Steps that create the cluster described by `desired`.
pub fn plan_creation(desired: &ClusterSpec) -> ChangeSet {
    vec![ChangeStep::CreateCluster {
        spec: Box::new(desired.clone()),
    }]
    .into()
}

/// Steps that remove the cluster. Protection is left as is, so a protected
/// cluster is vetoed by the guard rather than silently unprotected.
pub fn plan_deletion(observed: &ClusterState) -> ChangeSet {
    vec![ChangeStep::DeleteCluster {
        cluster_id: observed.id.clone(),
    }]
    .into()
}

fn diff_topology(desired: &ClusterSpec, observed: &ClusterState) -> (Vec<ChangeStep>, Vec<ChangeStep>) {
    let mut present_by_shard: BTreeMap<&str, Vec<&HostState>> = BTreeMap::new();
    for host in &observed.hosts {
        present_by_shard
            .entry(host.shard_name.as_str())
            .or_default()
            .push(host);
    }
    for hosts in present_by_shard.values_mut() {
        hosts.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
    }

    let mut additions = Vec::new();
    let mut removals = Vec::new();

    for shard in desired.shard_names() {
        let wanted: Vec<(usize, &HostSpec)> = desired
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.shard_key() == shard)
            .collect();
        let present = present_by_shard.remove(shard).unwrap_or_default();
        let (missing, surplus) = match_hosts(&wanted, present);

        let mut shard_exists = shard.is_empty() || observed.has_shard(shard);
        for (origin, host) in missing {
            if shard_exists {
                additions.push(ChangeStep::AddHost {
                    host: host.clone(),
                    origin,
                });
            } else {
                additions.push(ChangeStep::AddShard {
                    shard_name: shard.to_string(),
                    host: host.clone(),
                    origin,
                });
                shard_exists = true;
            }
        }
        for host in surplus {
            removals.push(ChangeStep::RemoveHost {
                fqdn: host.fqdn.clone(),
                shard_name: host.shard_name.clone(),
            });
        }
    }

    // Shards nobody asks for any more, drained host by host.
    for (shard, hosts) in present_by_shard {
        let Some((last, rest)) = hosts.split_last() else {
            continue;
        };
        for host in rest {
            removals.push(ChangeStep::RemoveHost {
                fqdn: host.fqdn.clone(),
                shard_name: shard.to_string(),
            });
        }
        if shard.is_empty() {
            removals.push(ChangeStep::RemoveHost {
                fqdn: last.fqdn.clone(),
                shard_name: String::new(),
            });
        } else {
            removals.push(ChangeStep::RemoveShard {
                shard_name: shard.to_string(),
                fqdn: last.fqdn.clone(),
            });
        }
    }

    (additions, removals)
}

/// Pair desired hosts with observed ones inside a shard. Explicit fqdns are
/// honored first; the rest match the earliest free observed host with the
/// same zone and subnet. Returns (unmatched desired, unmatched observed).
fn match_hosts<'d, 'o>(
    wanted: &[(usize, &'d HostSpec)],
    mut present: Vec<&'o HostState>,
) -> (Vec<(usize, &'d HostSpec)>, Vec<&'o HostState>) {
    let mut unpinned = Vec::new();
    for &(origin, host) in wanted {
        let pinned = host
            .fqdn
            .as_deref()
            .and_then(|fqdn| present.iter().position(|h| h.fqdn == fqdn));
        match pinned {
            Some(pos) => {
                present.remove(pos);
            }
            None => unpinned.push((origin, host)),
        }
    }

    let mut missing = Vec::new();
    for (origin, host) in unpinned {
        let pos = present
            .iter()
            .position(|h| h.zone == host.zone && h.subnet_id == host.subnet_id);
        match pos {
            Some(pos) => {
                present.remove(pos);
            }
            None => missing.push((origin, host)),
        }
    }
    (missing, present)
}

fn diff_metadata(desired: &ClusterSpec, observed: &ClusterState) -> Option<ChangeStep> {
    let mut update_mask = Vec::new();
    let mut description = None;
    let mut labels = None;
    let mut security_group_ids = None;

    if desired.description != observed.description {
        update_mask.push("description".to_string());
        description = Some(desired.description.clone());
    }
    if desired.labels != observed.labels {
        update_mask.push("labels".to_string());
        labels = Some(desired.labels.clone());
    }
    if desired.security_group_ids != observed.security_group_ids {
        update_mask.push("security_group_ids".to_string());
        security_group_ids = Some(desired.security_group_ids.clone());
    }

    if update_mask.is_empty() {
        return None;
    }
    Some(ChangeStep::UpdateMetadata {
        description,
        labels,
        security_group_ids,
        update_mask,
    })
}

/// `Some(want)` when the desired side sets a value the observed side lacks.
fn changed<T: PartialEq + Clone>(want: &Option<T>, have: &Option<T>) -> Option<T> {
    match want {
        Some(w) if have.as_ref() != Some(w) => Some(w.clone()),
        _ => None,
    }
}

fn diff_config(desired: &ClusterSpec, observed: &ClusterState) -> Option<ChangeStep> {
    let want = &desired.config;
    let have = &observed.config;

    let patch = RedisConfigPatch {
        version: (want.version != have.version).then(|| want.version.clone()),
        maxmemory_policy: changed(&want.maxmemory_policy, &have.maxmemory_policy),
        timeout: changed(&want.timeout, &have.timeout),
        notify_keyspace_events: changed(&want.notify_keyspace_events, &have.notify_keyspace_events),
        slowlog_log_slower_than: changed(&want.slowlog_log_slower_than, &have.slowlog_log_slower_than),
        slowlog_max_len: changed(&want.slowlog_max_len, &have.slowlog_max_len),
        databases: changed(&want.databases, &have.databases),
    };

    let update_mask: Vec<String> = [
        (patch.version.is_some(), "config_spec.version"),
        (patch.maxmemory_policy.is_some(), "config_spec.redis.maxmemory_policy"),
        (patch.timeout.is_some(), "config_spec.redis.timeout"),
        (patch.notify_keyspace_events.is_some(), "config_spec.redis.notify_keyspace_events"),
        (patch.slowlog_log_slower_than.is_some(), "config_spec.redis.slowlog_log_slower_than"),
        (patch.slowlog_max_len.is_some(), "config_spec.redis.slowlog_max_len"),
        (patch.databases.is_some(), "config_spec.redis.databases"),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .map(|(_, path)| path.to_string())
    .collect();

    if update_mask.is_empty() {
        return None;
    }
    Some(ChangeStep::UpdateConfig { patch, update_mask })
}

fn diff_resources(desired: &ClusterSpec, observed: &ClusterState) -> Option<ChangeStep> {
    let want = &desired.resources;
    let have = &observed.resources;

    let patch = ResourcesPatch {
        resource_preset_id: (want.resource_preset_id != have.resource_preset_id)
            .then(|| want.resource_preset_id.clone()),
        disk_size_gb: (want.disk_size_gb != have.disk_size_gb).then_some(want.disk_size_gb),
        disk_type_id: changed(&want.disk_type_id, &have.disk_type_id),
    };

    let update_mask: Vec<String> = [
        (patch.resource_preset_id.is_some(), "config_spec.resources.resource_preset_id"),
        (patch.disk_size_gb.is_some(), "config_spec.resources.disk_size"),
        (patch.disk_type_id.is_some(), "config_spec.resources.disk_type_id"),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .map(|(_, path)| path.to_string())
    .collect();

    if update_mask.is_empty() {
        return None;
    }
    Some(ChangeStep::UpdateResources { patch, update_mask })
}
