use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use cirrus_common::{ClusterSpec, ClusterState, ClusterStatus, HostSpec};

use crate::auth::TokenProvider;
use crate::types::{
    ApiError, Cluster, ClusterApi, Host, Operation, OperationOutcome, RemoteStatus, Shard,
    StatusCode, UpdateClusterRequest,
};

/// Message the control plane uses when deletion protection blocks a request.
pub const DELETION_PROTECTION_MESSAGE: &str =
    "The operation was rejected because cluster has 'deletion_protection' = ON";

/// In-process control plane with the same observable behavior as the remote
/// one: mutations return operations, take effect only when the operation
/// finishes, and are serialized per cluster.
#[derive(Clone)]
pub struct MemoryControlPlane {
    inner: Arc<RwLock<Inner>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    ready_after_polls: u32,
}

impl std::fmt::Debug for MemoryControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryControlPlane")
            .field("authenticated", &self.tokens.is_some())
            .field("ready_after_polls", &self.ready_after_polls)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Inner {
    clusters: BTreeMap<String, StoredCluster>,
    operations: BTreeMap<String, PendingOperation>,
    host_seq: u64,
    faults: Faults,
    calls: Vec<String>,
}

#[derive(Debug)]
struct StoredCluster {
    cluster: Cluster,
    hosts: Vec<Host>,
    shards: Vec<String>,
    active_operation: Option<String>,
}

#[derive(Debug)]
struct PendingOperation {
    operation: Operation,
    polls: u32,
    fail_with: Option<RemoteStatus>,
    mutation: Option<Mutation>,
}

#[derive(Debug)]
enum Mutation {
    Create { hosts: Vec<Host>, shards: Vec<String> },
    Update(UpdateClusterRequest),
    Delete,
    AddHosts(Vec<Host>),
    DeleteHosts(Vec<String>),
    AddShard { name: String, hosts: Vec<Host> },
    DeleteShard(String),
}

#[derive(Debug, Default)]
struct Faults {
    reject: Option<(String, RemoteStatus)>,
    fail_next_operation: Option<RemoteStatus>,
    stall: bool,
    transient_fetch_errors: u32,
}

impl Faults {
    fn take_rejection(&mut self, call: &str) -> Option<RemoteStatus> {
        let hit = matches!(&self.reject, Some((prefix, _)) if call.starts_with(prefix.as_str()));
        if !hit {
            return None;
        }
        self.reject.take().map(|(_, status)| status)
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tokens: None,
            ready_after_polls: 1,
        }
    }

    /// Require a token from `provider` on every call.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    /// Number of status fetches an operation needs before it reports `done`.
    pub fn with_ready_after_polls(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls.max(1);
        self
    }

    /// Reject the next mutating call synchronously with `status`.
    pub async fn reject_next(&self, status: RemoteStatus) {
        self.reject_call("", status).await;
    }

    /// Reject the next mutating call whose name starts with `prefix`.
    pub async fn reject_call(&self, prefix: &str, status: RemoteStatus) {
        self.inner.write().await.faults.reject = Some((prefix.to_string(), status));
    }

    /// Accept the next mutating call but finish its operation with `status`.
    pub async fn fail_next_operation(&self, status: RemoteStatus) {
        self.inner.write().await.faults.fail_next_operation = Some(status);
    }

    /// While stalled, operations never finish.
    pub async fn stall_operations(&self, stall: bool) {
        self.inner.write().await.faults.stall = stall;
    }

    /// Make the next `n` operation fetches fail with a transport error.
    pub async fn transient_fetch_errors(&self, n: u32) {
        self.inner.write().await.faults.transient_fetch_errors = n;
    }

    /// Names of every mutating call received, rejected ones included.
    pub async fn calls(&self) -> Vec<String> {
        self.inner.read().await.calls.clone()
    }

    /// Finish every pending operation as if the control plane had caught up
    /// in the background. Stalled operations stay pending.
    pub async fn settle(&self) {
        let mut inner = self.inner.write().await;
        if inner.faults.stall {
            return;
        }
        let pending: Vec<String> = inner
            .operations
            .iter()
            .filter(|(_, op)| !op.operation.done)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            Self::complete(&mut inner, &id);
        }
    }

    /// Create a running cluster directly, without an operation.
    pub async fn seed_cluster(&self, spec: &ClusterSpec) -> String {
        let mut inner = self.inner.write().await;
        let id = new_id("c9q");
        let hosts: Vec<Host> = spec
            .hosts
            .iter()
            .map(|h| make_host(&mut inner.host_seq, &id, h))
            .collect();
        let shards = shard_list(&hosts, spec.sharded);
        let mut cluster = cluster_from_spec(&id, spec);
        cluster.status = ClusterStatus::Running;
        inner.clusters.insert(
            id.clone(),
            StoredCluster {
                cluster,
                hosts,
                shards,
                active_operation: None,
            },
        );
        id
    }

    /// Current state of a cluster, bypassing authentication and faults.
    pub async fn cluster_state(&self, cluster_id: &str) -> Option<ClusterState> {
        let inner = self.inner.read().await;
        inner.clusters.get(cluster_id).map(|c| {
            let shards = c
                .shards
                .iter()
                .map(|name| Shard {
                    name: name.clone(),
                    cluster_id: cluster_id.to_string(),
                })
                .collect();
            c.cluster.clone().into_state(c.hosts.clone(), shards)
        })
    }

    async fn authorize(&self) -> Result<(), ApiError> {
        let Some(provider) = self.tokens.as_ref() else {
            return Ok(());
        };
        match provider.token().await {
            Ok(token) if !token.is_empty() => Ok(()),
            Ok(_) => Err(ApiError::Unauthenticated("empty token".to_string())),
            Err(ApiError::Unauthenticated(msg)) => Err(ApiError::Unauthenticated(msg)),
            Err(e) => Err(ApiError::Unauthenticated(e.to_string())),
        }
    }

    /// Common admission for a mutating call on an existing cluster.
    fn admit<'a>(
        inner: &'a mut Inner,
        cluster_id: &str,
        call: &str,
    ) -> Result<&'a mut StoredCluster, ApiError> {
        inner.calls.push(call.to_string());
        if let Some(status) = inner.faults.take_rejection(call) {
            return Err(ApiError::Remote(status));
        }
        let stored = inner.clusters.get_mut(cluster_id).ok_or_else(|| {
            ApiError::remote(
                StatusCode::NotFound,
                format!("cluster {cluster_id} not found"),
            )
        })?;
        if let Some(op) = stored.active_operation.as_deref() {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                format!("conflicting operation {op} is in progress on cluster {cluster_id}"),
            ));
        }
        Ok(stored)
    }

    fn submit(
        inner: &mut Inner,
        cluster_id: &str,
        description: &str,
        busy: ClusterStatus,
        mutation: Mutation,
    ) -> Operation {
        let now = Utc::now();
        let operation = Operation {
            id: new_id("mdb"),
            description: description.to_string(),
            cluster_id: cluster_id.to_string(),
            created_at: now,
            modified_at: now,
            done: false,
            outcome: None,
        };
        if let Some(stored) = inner.clusters.get_mut(cluster_id) {
            stored.active_operation = Some(operation.id.clone());
            stored.cluster.status = busy;
        }
        let fail_with = inner.faults.fail_next_operation.take();
        inner.operations.insert(
            operation.id.clone(),
            PendingOperation {
                operation: operation.clone(),
                polls: 0,
                fail_with,
                mutation: Some(mutation),
            },
        );
        tracing::debug!(operation_id = %operation.id, cluster_id, description, "operation submitted");
        operation
    }

    fn complete(inner: &mut Inner, operation_id: &str) {
        let Some(pending) = inner.operations.get_mut(operation_id) else {
            return;
        };
        let cluster_id = pending.operation.cluster_id.clone();
        let mutation = pending.mutation.take();
        let failure = pending.fail_with.take();
        pending.operation.done = true;
        pending.operation.modified_at = Utc::now();

        if let Some(status) = failure {
            pending.operation.outcome = Some(OperationOutcome::Error(status));
            if matches!(mutation, Some(Mutation::Create { .. })) {
                inner.clusters.remove(&cluster_id);
            } else if let Some(stored) = inner.clusters.get_mut(&cluster_id) {
                stored.active_operation = None;
                stored.cluster.status = ClusterStatus::Running;
            }
            return;
        }

        pending.operation.outcome = Some(OperationOutcome::Response {
            resource_id: cluster_id.clone(),
        });

        if let Some(Mutation::Delete) = mutation {
            inner.clusters.remove(&cluster_id);
            return;
        }
        let Some(stored) = inner.clusters.get_mut(&cluster_id) else {
            return;
        };
        match mutation {
            Some(Mutation::Create { hosts, shards }) => {
                stored.hosts = hosts;
                stored.shards = shards;
            }
            Some(Mutation::Update(req)) => apply_update(&mut stored.cluster, &req),
            Some(Mutation::AddHosts(hosts)) => stored.hosts.extend(hosts),
            Some(Mutation::DeleteHosts(fqdns)) => stored.hosts.retain(|h| !fqdns.contains(&h.name)),
            Some(Mutation::AddShard { name, hosts }) => {
                stored.shards.push(name);
                stored.hosts.extend(hosts);
            }
            Some(Mutation::DeleteShard(name)) => {
                stored.shards.retain(|s| *s != name);
                stored.hosts.retain(|h| h.shard_name != name);
            }
            Some(Mutation::Delete) | None => {}
        }
        stored.active_operation = None;
        stored.cluster.status = ClusterStatus::Running;
    }
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &raw[..17])
}

fn make_host(seq: &mut u64, cluster_id: &str, spec: &HostSpec) -> Host {
    *seq += 1;
    Host {
        name: format!("{}-{:04}.mdb.cloud.internal", spec.zone, seq),
        cluster_id: cluster_id.to_string(),
        zone_id: spec.zone.clone(),
        subnet_id: spec.subnet_id.clone(),
        shard_name: spec.shard_key().to_string(),
    }
}

fn shard_list(hosts: &[Host], sharded: bool) -> Vec<String> {
    if !sharded {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::new();
    for h in hosts {
        if !out.contains(&h.shard_name) {
            out.push(h.shard_name.clone());
        }
    }
    out
}

fn cluster_from_spec(id: &str, spec: &ClusterSpec) -> Cluster {
    Cluster {
        id: id.to_string(),
        folder_id: spec.folder_id.clone(),
        name: spec.name.clone(),
        description: spec.description.clone(),
        environment: spec.environment,
        network_id: spec.network_id.clone(),
        labels: spec.labels.clone(),
        security_group_ids: spec.security_group_ids.clone(),
        status: ClusterStatus::Creating,
        tls_enabled: spec.tls_enabled,
        sharded: spec.sharded,
        config: spec.config.clone(),
        resources: spec.resources.clone(),
        maintenance_window: spec.maintenance_window.clone(),
        deletion_protection: spec.deletion_protection,
        created_at: Utc::now(),
    }
}

fn apply_update(cluster: &mut Cluster, req: &UpdateClusterRequest) {
    if let Some(v) = &req.description {
        cluster.description = v.clone();
    }
    if let Some(v) = &req.labels {
        cluster.labels = v.clone();
    }
    if let Some(v) = &req.security_group_ids {
        cluster.security_group_ids = v.clone();
    }
    if let Some(v) = req.environment {
        cluster.environment = v;
    }
    if let Some(patch) = &req.config {
        patch.apply_to(&mut cluster.config);
    }
    if let Some(patch) = &req.resources {
        patch.apply_to(&mut cluster.resources);
    }
    if let Some(v) = &req.maintenance_window {
        cluster.maintenance_window = v.clone();
    }
    if let Some(v) = req.deletion_protection {
        cluster.deletion_protection = v;
    }
}

fn check_host_shard(sharded: bool, shards: &[String], host: &HostSpec) -> Result<(), ApiError> {
    match (sharded, host.shard_name.as_deref()) {
        (true, None) => Err(ApiError::remote(
            StatusCode::InvalidArgument,
            "shard name is required for hosts of a sharded cluster",
        )),
        (false, Some(_)) => Err(ApiError::remote(
            StatusCode::InvalidArgument,
            "shard name is not allowed for hosts of a non-sharded cluster",
        )),
        (true, Some(name)) if !shards.iter().any(|s| s == name) => Err(ApiError::remote(
            StatusCode::NotFound,
            format!("shard {name} not found"),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl ClusterApi for MemoryControlPlane {
    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster, ApiError> {
        self.authorize().await?;
        let inner = self.inner.read().await;
        inner
            .clusters
            .get(cluster_id)
            .map(|c| c.cluster.clone())
            .ok_or_else(|| {
                ApiError::remote(
                    StatusCode::NotFound,
                    format!("cluster {cluster_id} not found"),
                )
            })
    }

    async fn list_clusters(&self, folder_id: &str) -> Result<Vec<Cluster>, ApiError> {
        self.authorize().await?;
        let inner = self.inner.read().await;
        Ok(inner
            .clusters
            .values()
            .filter(|c| c.cluster.folder_id == folder_id)
            .map(|c| c.cluster.clone())
            .collect())
    }

    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<Host>, ApiError> {
        self.authorize().await?;
        let inner = self.inner.read().await;
        inner
            .clusters
            .get(cluster_id)
            .map(|c| c.hosts.clone())
            .ok_or_else(|| {
                ApiError::remote(
                    StatusCode::NotFound,
                    format!("cluster {cluster_id} not found"),
                )
            })
    }

    async fn list_shards(&self, cluster_id: &str) -> Result<Vec<Shard>, ApiError> {
        self.authorize().await?;
        let inner = self.inner.read().await;
        let stored = inner.clusters.get(cluster_id).ok_or_else(|| {
            ApiError::remote(
                StatusCode::NotFound,
                format!("cluster {cluster_id} not found"),
            )
        })?;
        Ok(stored
            .shards
            .iter()
            .map(|name| Shard {
                name: name.clone(),
                cluster_id: cluster_id.to_string(),
            })
            .collect())
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        inner.calls.push("create_cluster".to_string());
        if let Some(status) = inner.faults.take_rejection("create_cluster") {
            return Err(ApiError::Remote(status));
        }
        if inner
            .clusters
            .values()
            .any(|c| c.cluster.folder_id == spec.folder_id && c.cluster.name == spec.name)
        {
            return Err(ApiError::remote(
                StatusCode::AlreadyExists,
                format!("cluster {} already exists", spec.name),
            ));
        }
        if spec.hosts.is_empty() {
            return Err(ApiError::remote(
                StatusCode::InvalidArgument,
                "at least one host is required",
            ));
        }
        let id = new_id("c9q");
        let declared: Vec<String> = if spec.sharded {
            spec.shard_names().into_iter().map(String::from).collect()
        } else {
            Vec::new()
        };
        for h in &spec.hosts {
            check_host_shard(spec.sharded, &declared, h)?;
        }
        let hosts: Vec<Host> = spec
            .hosts
            .iter()
            .map(|h| make_host(&mut inner.host_seq, &id, h))
            .collect();
        let shards = shard_list(&hosts, spec.sharded);
        inner.clusters.insert(
            id.clone(),
            StoredCluster {
                cluster: cluster_from_spec(&id, spec),
                hosts: Vec::new(),
                shards: Vec::new(),
                active_operation: None,
            },
        );
        Ok(Self::submit(
            &mut inner,
            &id,
            "Create Redis cluster",
            ClusterStatus::Creating,
            Mutation::Create { hosts, shards },
        ))
    }

    async fn update_cluster(&self, req: &UpdateClusterRequest) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let call = format!("update_cluster[{}]", req.update_mask.join(","));
        let stored = Self::admit(&mut inner, &req.cluster_id, &call)?;
        let protected = stored.cluster.deletion_protection && req.deletion_protection != Some(false);
        let env_change = req
            .environment
            .is_some_and(|env| env != stored.cluster.environment);
        if protected && env_change {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                DELETION_PROTECTION_MESSAGE,
            ));
        }
        Ok(Self::submit(
            &mut inner,
            &req.cluster_id,
            "Update Redis cluster",
            ClusterStatus::Updating,
            Mutation::Update(req.clone()),
        ))
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let stored = Self::admit(&mut inner, cluster_id, "delete_cluster")?;
        if stored.cluster.deletion_protection {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                DELETION_PROTECTION_MESSAGE,
            ));
        }
        Ok(Self::submit(
            &mut inner,
            cluster_id,
            "Delete Redis cluster",
            ClusterStatus::Stopping,
            Mutation::Delete,
        ))
    }

    async fn add_hosts(&self, cluster_id: &str, hosts: &[HostSpec]) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let stored = Self::admit(&mut inner, cluster_id, "add_hosts")?;
        for h in hosts {
            check_host_shard(stored.cluster.sharded, &stored.shards, h)?;
        }
        let created: Vec<Host> = hosts
            .iter()
            .map(|h| make_host(&mut inner.host_seq, cluster_id, h))
            .collect();
        Ok(Self::submit(
            &mut inner,
            cluster_id,
            "Add hosts to Redis cluster",
            ClusterStatus::Updating,
            Mutation::AddHosts(created),
        ))
    }

    async fn delete_hosts(&self, cluster_id: &str, fqdns: &[String]) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let stored = Self::admit(&mut inner, cluster_id, "delete_hosts")?;
        for fqdn in fqdns {
            if !stored.hosts.iter().any(|h| &h.name == fqdn) {
                return Err(ApiError::remote(
                    StatusCode::NotFound,
                    format!("host {fqdn} not found"),
                ));
            }
        }
        let remaining: Vec<&Host> = stored
            .hosts
            .iter()
            .filter(|h| !fqdns.contains(&h.name))
            .collect();
        if remaining.is_empty() {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                "last host of the cluster cannot be deleted",
            ));
        }
        if let Some(empty) = stored
            .shards
            .iter()
            .find(|s| !remaining.iter().any(|h| &h.shard_name == *s))
        {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                format!("last host of shard {empty} cannot be deleted"),
            ));
        }
        Ok(Self::submit(
            &mut inner,
            cluster_id,
            "Delete hosts from Redis cluster",
            ClusterStatus::Updating,
            Mutation::DeleteHosts(fqdns.to_vec()),
        ))
    }

    async fn add_shard(
        &self,
        cluster_id: &str,
        shard_name: &str,
        hosts: &[HostSpec],
    ) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let stored = Self::admit(&mut inner, cluster_id, "add_shard")?;
        if !stored.cluster.sharded {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                "cluster is not sharded",
            ));
        }
        if stored.shards.iter().any(|s| s == shard_name) {
            return Err(ApiError::remote(
                StatusCode::AlreadyExists,
                format!("shard {shard_name} already exists"),
            ));
        }
        if hosts.is_empty() {
            return Err(ApiError::remote(
                StatusCode::InvalidArgument,
                "a new shard needs at least one host",
            ));
        }
        let created: Vec<Host> = hosts
            .iter()
            .map(|h| {
                let mut h = h.clone();
                h.shard_name = Some(shard_name.to_string());
                make_host(&mut inner.host_seq, cluster_id, &h)
            })
            .collect();
        Ok(Self::submit(
            &mut inner,
            cluster_id,
            "Add shard to Redis cluster",
            ClusterStatus::Updating,
            Mutation::AddShard {
                name: shard_name.to_string(),
                hosts: created,
            },
        ))
    }

    async fn delete_shard(
        &self,
        cluster_id: &str,
        shard_name: &str,
    ) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        let stored = Self::admit(&mut inner, cluster_id, "delete_shard")?;
        if !stored.shards.iter().any(|s| s == shard_name) {
            return Err(ApiError::remote(
                StatusCode::NotFound,
                format!("shard {shard_name} not found"),
            ));
        }
        if stored.shards.len() == 1 {
            return Err(ApiError::remote(
                StatusCode::FailedPrecondition,
                "last shard of the cluster cannot be deleted",
            ));
        }
        Ok(Self::submit(
            &mut inner,
            cluster_id,
            "Delete shard from Redis cluster",
            ClusterStatus::Updating,
            Mutation::DeleteShard(shard_name.to_string()),
        ))
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Operation, ApiError> {
        self.authorize().await?;
        let mut inner = self.inner.write().await;
        if inner.faults.transient_fetch_errors > 0 {
            inner.faults.transient_fetch_errors -= 1;
            return Err(ApiError::Transport("connection reset by peer".to_string()));
        }
        let stall = inner.faults.stall;
        let ready_after = self.ready_after_polls;
        let pending = inner.operations.get_mut(operation_id).ok_or_else(|| {
            ApiError::remote(
                StatusCode::NotFound,
                format!("operation {operation_id} not found"),
            )
        })?;
        if !pending.operation.done && !stall {
            pending.polls += 1;
            if pending.polls >= ready_after {
                Self::complete(&mut inner, operation_id);
            }
        }
        // A finished operation is reported once, then forgotten.
        let finished = inner
            .operations
            .get(operation_id)
            .is_some_and(|p| p.operation.done);
        let operation = if finished {
            inner.operations.remove(operation_id).map(|p| p.operation)
        } else {
            inner.operations.get(operation_id).map(|p| p.operation.clone())
        };
        operation.ok_or_else(|| {
            ApiError::remote(
                StatusCode::NotFound,
                format!("operation {operation_id} not found"),
            )
        })
    }
}
