use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use cirrus_api::{RedisConfigPatch, ResourcesPatch, UpdateClusterRequest};
use cirrus_common::{ClusterSpec, Environment, HostSpec, MaintenanceWindow};

/// One remote mutation the engine may issue against a cluster.
///
/// `origin` on host additions is the index of the realized entry in
/// `ClusterSpec::hosts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeStep {
    CreateCluster {
        spec: Box<ClusterSpec>,
    },
    DeleteCluster {
        cluster_id: String,
    },
    UpdateDeletionProtection {
        enabled: bool,
    },
    /// Creates the shard together with its first host.
    AddShard {
        shard_name: String,
        host: HostSpec,
        origin: usize,
    },
    AddHost {
        host: HostSpec,
        origin: usize,
    },
    RemoveHost {
        fqdn: String,
        shard_name: String,
    },
    /// Drops the shard along with its last remaining host.
    RemoveShard {
        shard_name: String,
        fqdn: String,
    },
    UpdateEnvironment {
        from: Environment,
        to: Environment,
    },
    UpdateMetadata {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        labels: Option<BTreeMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        security_group_ids: Option<BTreeSet<String>>,
        update_mask: Vec<String>,
    },
    UpdateConfig {
        patch: RedisConfigPatch,
        update_mask: Vec<String>,
    },
    UpdateResources {
        patch: ResourcesPatch,
        update_mask: Vec<String>,
    },
    UpdateMaintenanceWindow {
        window: MaintenanceWindow,
    },
}

impl ChangeStep {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeStep::CreateCluster { .. } => "create_cluster",
            ChangeStep::DeleteCluster { .. } => "delete_cluster",
            ChangeStep::UpdateDeletionProtection { .. } => "update_deletion_protection",
            ChangeStep::AddShard { .. } => "add_shard",
            ChangeStep::AddHost { .. } => "add_host",
            ChangeStep::RemoveHost { .. } => "remove_host",
            ChangeStep::RemoveShard { .. } => "remove_shard",
            ChangeStep::UpdateEnvironment { .. } => "update_environment",
            ChangeStep::UpdateMetadata { .. } => "update_metadata",
            ChangeStep::UpdateConfig { .. } => "update_config",
            ChangeStep::UpdateResources { .. } => "update_resources",
            ChangeStep::UpdateMaintenanceWindow { .. } => "update_maintenance_window",
        }
    }

    /// Steps that take hosts or shards away.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            ChangeStep::RemoveHost { .. }
                | ChangeStep::RemoveShard { .. }
                | ChangeStep::DeleteCluster { .. }
        )
    }

    /// Host count change this step causes on one shard (`""` is the
    /// unsharded pool), or `None` for steps that leave topology alone.
    pub fn host_delta(&self) -> Option<(&str, i64)> {
        match self {
            ChangeStep::AddShard { shard_name, .. } => Some((shard_name.as_str(), 1)),
            ChangeStep::AddHost { host, .. } => Some((host.shard_key(), 1)),
            ChangeStep::RemoveHost { shard_name, .. }
            | ChangeStep::RemoveShard { shard_name, .. } => Some((shard_name.as_str(), -1)),
            _ => None,
        }
    }

    /// The partial update request for steps served by `UpdateCluster`.
    pub fn update_request(&self, cluster_id: &str) -> Option<UpdateClusterRequest> {
        let mut req = UpdateClusterRequest::new(cluster_id);
        match self {
            ChangeStep::UpdateDeletionProtection { enabled } => {
                req.update_mask = vec!["deletion_protection".to_string()];
                req.deletion_protection = Some(*enabled);
            }
            ChangeStep::UpdateEnvironment { to, .. } => {
                req.update_mask = vec!["environment".to_string()];
                req.environment = Some(*to);
            }
            ChangeStep::UpdateMetadata {
                description,
                labels,
                security_group_ids,
                update_mask,
            } => {
                req.update_mask = update_mask.clone();
                req.description = description.clone();
                req.labels = labels.clone();
                req.security_group_ids = security_group_ids.clone();
            }
            ChangeStep::UpdateConfig { patch, update_mask } => {
                req.update_mask = update_mask.clone();
                req.config = Some(patch.clone());
            }
            ChangeStep::UpdateResources { patch, update_mask } => {
                req.update_mask = update_mask.clone();
                req.resources = Some(patch.clone());
            }
            ChangeStep::UpdateMaintenanceWindow { window } => {
                req.update_mask = vec!["maintenance_window".to_string()];
                req.maintenance_window = Some(window.clone());
            }
            _ => return None,
        }
        Some(req)
    }
}

impl fmt::Display for ChangeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeStep::CreateCluster { spec } => write!(f, "create_cluster({})", spec.name),
            ChangeStep::DeleteCluster { cluster_id } => write!(f, "delete_cluster({cluster_id})"),
            ChangeStep::UpdateDeletionProtection { enabled } => {
                write!(f, "update_deletion_protection({enabled})")
            }
            ChangeStep::AddShard {
                shard_name, host, ..
            } => write!(f, "add_shard({shard_name}, zone={})", host.zone),
            ChangeStep::AddHost { host, .. } => match host.shard_name.as_deref() {
                Some(shard) => write!(f, "add_host(shard={shard}, zone={})", host.zone),
                None => write!(f, "add_host(zone={})", host.zone),
            },
            ChangeStep::RemoveHost { fqdn, .. } => write!(f, "remove_host({fqdn})"),
            ChangeStep::RemoveShard { shard_name, .. } => write!(f, "remove_shard({shard_name})"),
            ChangeStep::UpdateEnvironment { from, to } => {
                write!(f, "update_environment({from} -> {to})")
            }
            ChangeStep::UpdateMetadata { update_mask, .. }
            | ChangeStep::UpdateConfig { update_mask, .. }
            | ChangeStep::UpdateResources { update_mask, .. } => {
                write!(f, "{}[{}]", self.kind(), update_mask.join(","))
            }
            ChangeStep::UpdateMaintenanceWindow { .. } => f.write_str(self.kind()),
        }
    }
}

/// Ordered steps; executed front to back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    steps: Vec<ChangeStep>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: ChangeStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeStep> {
        self.steps.iter()
    }

    pub fn steps(&self) -> &[ChangeStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<ChangeStep> {
        self.steps
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.steps.iter().map(ChangeStep::kind).collect()
    }
}

impl From<Vec<ChangeStep>> for ChangeSet {
    fn from(steps: Vec<ChangeStep>) -> Self {
        Self { steps }
    }
}

impl FromIterator<ChangeStep> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ChangeStep>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeStep;
    type IntoIter = std::slice::Iter<'a, ChangeStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
