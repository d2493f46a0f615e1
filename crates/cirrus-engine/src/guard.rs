use cirrus_common::ClusterState;

use crate::change::{ChangeSet, ChangeStep};
use crate::error::GuardRejection;

/// Veto change sets that would break cluster safety if applied in order to
/// `current`. The set is returned untouched when every check passes.
///
/// Checks run in this order: deletion protection, per-shard host counts,
/// total host count.
pub fn validate(current: &ClusterState, proposed: ChangeSet) -> Result<ChangeSet, GuardRejection> {
    check_protection(current, &proposed)?;
    check_topology(current, &proposed)?;
    Ok(proposed)
}

fn check_protection(current: &ClusterState, proposed: &ChangeSet) -> Result<(), GuardRejection> {
    let mut protected = current.deletion_protection;
    for step in proposed {
        match step {
            ChangeStep::UpdateDeletionProtection { enabled } => protected = *enabled,
            ChangeStep::DeleteCluster { .. } | ChangeStep::UpdateEnvironment { .. } if protected => {
                return Err(GuardRejection::ProtectedResource {
                    cluster_id: current.id.clone(),
                    step: step.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_topology(current: &ClusterState, proposed: &ChangeSet) -> Result<(), GuardRejection> {
    let deletes_cluster = proposed
        .iter()
        .any(|s| matches!(s, ChangeStep::DeleteCluster { .. }));
    let mut counts = current.hosts_per_shard();
    let mut emptied = false;

    for (index, step) in proposed.iter().enumerate() {
        match step {
            ChangeStep::AddShard { shard_name, .. } => {
                *counts.entry(shard_name.clone()).or_insert(0) += 1;
            }
            ChangeStep::AddHost { host, .. } => {
                *counts.entry(host.shard_key().to_string()).or_insert(0) += 1;
            }
            ChangeStep::RemoveHost { shard_name, .. } => {
                let count = counts.entry(shard_name.clone()).or_insert(0);
                *count = count.saturating_sub(1);
                if *count == 0 && !shard_name.is_empty() {
                    return Err(GuardRejection::WouldEmptyShard {
                        shard_name: shard_name.clone(),
                        index,
                        step: step.to_string(),
                    });
                }
            }
            ChangeStep::RemoveShard { shard_name, .. } => {
                if counts.remove(shard_name).is_none() {
                    return Err(GuardRejection::UnknownShard {
                        cluster_id: current.id.clone(),
                        shard_name: shard_name.clone(),
                    });
                }
            }
            _ => continue,
        }
        if step.is_removal() && counts.values().sum::<usize>() == 0 {
            emptied = true;
        }
    }

    if emptied && !deletes_cluster {
        return Err(GuardRejection::WouldEmptyCluster {
            cluster_id: current.id.clone(),
        });
    }
    Ok(())
}
