use std::slice;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use cirrus_api::{ApiError, Cluster, ClusterApi, Operation, StatusCode};
use cirrus_common::{ClusterSpec, ClusterState};

use crate::aggregate::{aggregate, ConvergenceResult, StepOutcome, StepReport};
use crate::change::{ChangeSet, ChangeStep};
use crate::differ::{diff, plan_creation, plan_deletion};
use crate::error::EngineError;
use crate::guard;
use crate::metrics::{inc, SharedMetrics};
use crate::poller::{deadline_after, OperationPoller, OperationResult, PollerConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Longest wait for a single step's operation.
    pub step_timeout_secs: u64,
    pub poller: PollerConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 3_600,
            poller: PollerConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Brings one cluster at a time to its desired state.
///
/// Holds no per-cluster state: concurrent `converge` calls for different
/// clusters only share the API client and the counters. Steps of a single
/// call run strictly one after another.
pub struct ConvergenceDriver<A: ?Sized> {
    api: Arc<A>,
    cfg: DriverConfig,
    poller: OperationPoller,
    metrics: Arc<SharedMetrics>,
}

impl<A: ?Sized> Clone for ConvergenceDriver<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            cfg: self.cfg.clone(),
            poller: self.poller.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<A: ClusterApi + ?Sized> ConvergenceDriver<A> {
    pub fn new(api: Arc<A>, cfg: DriverConfig) -> Self {
        let poller = OperationPoller::new(cfg.poller.clone());
        Self {
            api,
            cfg,
            poller,
            metrics: Arc::new(SharedMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<SharedMetrics> {
        &self.metrics
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub async fn find_cluster(&self, folder_id: &str, name: &str) -> Result<Option<Cluster>, EngineError> {
        let clusters = self.api.list_clusters(folder_id).await?;
        Ok(clusters.into_iter().find(|c| c.name == name))
    }

    /// Fresh snapshot of the cluster from the three read calls.
    pub async fn fetch_state(&self, cluster_id: &str) -> Result<ClusterState, EngineError> {
        let cluster = self.api.get_cluster(cluster_id).await?;
        let hosts = self.api.list_hosts(cluster_id).await?;
        let shards = self.api.list_shards(cluster_id).await?;
        Ok(cluster.into_state(hosts, shards))
    }

    /// Dry run: the change set `converge` would start from right now.
    pub async fn plan(&self, spec: &ClusterSpec) -> Result<ChangeSet, EngineError> {
        match self.find_cluster(&spec.folder_id, &spec.name).await? {
            None => Ok(plan_creation(spec)),
            Some(cluster) => {
                let observed = self.fetch_state(&cluster.id).await?;
                Ok(diff(spec, &observed))
            }
        }
    }

    /// Converge the cluster named by `spec` within `timeout`.
    ///
    /// `Err` means nothing was issued (guard veto, credentials, reading the
    /// current state failed). Everything that happened after the first
    /// remote mutation is reported through the returned result.
    pub async fn converge(
        &self,
        spec: &ClusterSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceResult, EngineError> {
        let span = info_span!("converge", cluster = %spec.name, folder = %spec.folder_id);
        let result = self
            .converge_inner(spec, timeout, cancel)
            .instrument(span)
            .await;
        self.record(&spec.name, &result);
        result
    }

    async fn converge_inner(
        &self,
        spec: &ClusterSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceResult, EngineError> {
        let deadline = deadline_after(Instant::now(), timeout);

        let Some(cluster) = self.find_cluster(&spec.folder_id, &spec.name).await? else {
            info!("cluster not found, creating");
            return self
                .execute(None, plan_creation(spec), deadline, cancel, Some(spec))
                .await;
        };
        if cluster.status.is_busy() {
            info!(cluster_id = %cluster.id, status = ?cluster.status, "operation in flight, deferring");
            return Ok(ConvergenceResult::in_progress(cluster.id));
        }

        let observed = self.fetch_state(&cluster.id).await?;
        let changes = diff(spec, &observed);
        if changes.is_empty() {
            debug!(cluster_id = %observed.id, "already converged");
            return Ok(aggregate(Some(observed.id), Vec::new(), ChangeSet::new()));
        }

        let changes = guard::validate(&observed, changes)?;
        info!(cluster_id = %observed.id, steps = changes.len(), plan = ?changes.kinds(), "applying change set");
        self.execute(Some(observed.id), changes, deadline, cancel, Some(spec))
            .await
    }

    /// Delete a cluster through the guard. A cluster that is already gone
    /// counts as decommissioned.
    pub async fn decommission(
        &self,
        cluster_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceResult, EngineError> {
        let span = info_span!("decommission", cluster_id = %cluster_id);
        let result = self
            .decommission_inner(cluster_id, timeout, cancel)
            .instrument(span)
            .await;
        self.record(cluster_id, &result);
        result
    }

    async fn decommission_inner(
        &self,
        cluster_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceResult, EngineError> {
        let deadline = deadline_after(Instant::now(), timeout);
        let observed = match self.fetch_state(cluster_id).await {
            Ok(state) => state,
            Err(EngineError::Api(e)) if e.is_not_found() => {
                info!("cluster already gone");
                return Ok(aggregate(Some(cluster_id.to_string()), Vec::new(), ChangeSet::new()));
            }
            Err(e) => return Err(e),
        };
        if observed.status.is_busy() {
            info!(status = ?observed.status, "operation in flight, deferring");
            return Ok(ConvergenceResult::in_progress(cluster_id));
        }
        let changes = guard::validate(&observed, plan_deletion(&observed))?;
        self.execute(Some(observed.id), changes, deadline, cancel, None)
            .await
    }

    /// Run `changes` in order, stopping at the first failure. With
    /// `verify_against` set, a fully applied run is followed by a re-diff.
    async fn execute(
        &self,
        mut cluster_id: Option<String>,
        changes: ChangeSet,
        deadline: Instant,
        cancel: &CancellationToken,
        verify_against: Option<&ClusterSpec>,
    ) -> Result<ConvergenceResult, EngineError> {
        let steps = changes.into_steps();
        let mut reports = Vec::with_capacity(steps.len());
        let mut halted = false;
        let mut revalidated = false;

        for (index, step) in steps.iter().enumerate() {
            if halted {
                reports.push(StepReport::skipped(index, step.clone()));
                continue;
            }

            // Earlier steps changed the cluster; check the removals against
            // what is really there now.
            if step.is_removal() && index > 0 && !revalidated {
                revalidated = true;
                if let Some(id) = cluster_id.as_deref() {
                    if let Err(e) = self.revalidate(id, &steps[index..]).await {
                        warn!(step = %step, error = %e, "re-validation before removals failed");
                        reports.push(StepReport::failed(index, step.clone(), e));
                        halted = true;
                        continue;
                    }
                }
            }

            let (op, step_deadline) = match self
                .submit_step(cluster_id.as_deref(), step, deadline, cancel)
                .await
            {
                Ok(submitted) => submitted,
                Err(e) => {
                    warn!(step = %step, error = %e, "step not submitted");
                    reports.push(StepReport::failed(index, step.clone(), e));
                    halted = true;
                    continue;
                }
            };
            // A create names its cluster on submission, long before it is done.
            if cluster_id.is_none() {
                cluster_id = Some(op.cluster_id.clone());
            }

            match self.await_step(step, &op, step_deadline, cancel).await {
                Ok(()) => {
                    info!(step = %step, operation_id = %op.id, "step applied");
                    reports.push(StepReport::applied(index, step.clone(), op.id));
                }
                Err(e) => {
                    warn!(step = %step, operation_id = %op.id, error = %e, "step did not complete");
                    let mut report = StepReport::failed(index, step.clone(), e);
                    report.operation_id = Some(op.id);
                    reports.push(report);
                    halted = true;
                }
            }
        }

        let all_applied = reports.iter().all(|r| r.outcome == StepOutcome::Applied);
        let residual = match (verify_against, cluster_id.as_deref()) {
            (Some(spec), Some(id)) if all_applied => match self.verify(spec, id).await {
                Ok(residual) => residual,
                Err(e) => {
                    warn!(cluster_id = id, error = %e, "verification pass skipped");
                    ChangeSet::new()
                }
            },
            _ => ChangeSet::new(),
        };
        Ok(aggregate(cluster_id, reports, residual))
    }

    async fn revalidate(&self, cluster_id: &str, rest: &[ChangeStep]) -> Result<(), EngineError> {
        let fresh = self.fetch_state(cluster_id).await?;
        if let Err(rejection) = guard::validate(&fresh, rest.to_vec().into()) {
            inc(&self.metrics.guard_rejections_total);
            return Err(rejection.into());
        }
        Ok(())
    }

    async fn verify(&self, spec: &ClusterSpec, cluster_id: &str) -> Result<ChangeSet, EngineError> {
        let fresh = self.fetch_state(cluster_id).await?;
        let residual = diff(spec, &fresh);
        if !residual.is_empty() {
            warn!(cluster_id, residual = ?residual.kinds(), "cluster diverged after applying changes");
        }
        Ok(residual)
    }

    /// Submit one step. Returns the operation handle and the instant by
    /// which it has to finish: the step budget, capped at `deadline`.
    async fn submit_step(
        &self,
        cluster_id: Option<&str>,
        step: &ChangeStep,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(Operation, Instant), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::Timeout {
                operation_id: None,
                waited: Duration::ZERO,
            });
        }
        let step_deadline = deadline_after(now, self.cfg.step_timeout()).min(deadline);

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            r = self.submit(cluster_id.unwrap_or_default(), step) => r,
        };
        let op = submitted.map_err(|e| match e {
            ApiError::Remote(status) => EngineError::RemoteRejected {
                step: step.to_string(),
                status,
            },
            other => EngineError::from(other),
        })?;
        debug!(step = %step, operation_id = %op.id, "operation submitted");
        Ok((op, step_deadline))
    }

    async fn await_step(
        &self,
        step: &ChangeStep,
        op: &Operation,
        step_deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match self
            .poller
            .await_operation(self.api.as_ref(), op, step_deadline, cancel)
            .await
        {
            OperationResult::Done { .. } => Ok(()),
            OperationResult::Failed(status) => Err(EngineError::RemoteRejected {
                step: step.to_string(),
                status,
            }),
            OperationResult::Timeout { waited } => Err(EngineError::Timeout {
                operation_id: Some(op.id.clone()),
                waited,
            }),
            OperationResult::PollFailed {
                error: ApiError::Unauthenticated(msg),
                ..
            } => Err(EngineError::AuthFailure(msg)),
            OperationResult::PollFailed { attempts, error } => Err(EngineError::PollFailed {
                operation_id: op.id.clone(),
                attempts,
                error,
            }),
            OperationResult::Cancelled => Err(EngineError::Cancelled),
        }
    }

    async fn submit(&self, cluster_id: &str, step: &ChangeStep) -> Result<Operation, ApiError> {
        match step {
            ChangeStep::CreateCluster { spec } => self.api.create_cluster(spec).await,
            ChangeStep::DeleteCluster { cluster_id } => self.api.delete_cluster(cluster_id).await,
            ChangeStep::AddShard {
                shard_name, host, ..
            } => {
                self.api
                    .add_shard(cluster_id, shard_name, slice::from_ref(host))
                    .await
            }
            ChangeStep::AddHost { host, .. } => {
                self.api.add_hosts(cluster_id, slice::from_ref(host)).await
            }
            ChangeStep::RemoveHost { fqdn, .. } => {
                self.api.delete_hosts(cluster_id, slice::from_ref(fqdn)).await
            }
            ChangeStep::RemoveShard { shard_name, .. } => {
                self.api.delete_shard(cluster_id, shard_name).await
            }
            update => match update.update_request(cluster_id) {
                Some(req) => self.api.update_cluster(&req).await,
                None => Err(ApiError::remote(
                    StatusCode::InvalidArgument,
                    format!("{update} has no remote mapping"),
                )),
            },
        }
    }

    fn record(&self, cluster: &str, result: &Result<ConvergenceResult, EngineError>) {
        inc(&self.metrics.converge_total);
        match result {
            Ok(res) => {
                self.metrics.observe(res);
                info!(
                    cluster,
                    status = ?res.status,
                    applied = res.applied,
                    total = res.total,
                    "convergence finished"
                );
            }
            Err(e) => {
                inc(&self.metrics.converge_failed_total);
                if matches!(e, EngineError::ValidationRejected(_)) {
                    inc(&self.metrics.guard_rejections_total);
                }
                warn!(cluster, error = %e, "convergence aborted");
            }
        }
    }
}
