use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cirrus_api::{
    ApiError, Cluster, ClusterApi, Host, MemoryControlPlane, Operation, RemoteStatus, Shard,
    StaticToken, StatusCode, TokenProvider, UpdateClusterRequest,
};
use cirrus_common::telemetry::init_test_tracing;
use cirrus_common::{
    ClusterSpec, Environment, HostSpec, MaintenanceWindow, RedisConfig, Resources, WeekDay,
};
use cirrus_engine::{
    ConvergenceDriver, ConvergenceStatus, DriverConfig, EngineError, GuardRejection, PollerConfig,
    StepOutcome, SweepConfig, Sweeper,
};

const TIMEOUT: Duration = Duration::from_secs(600);

fn config() -> DriverConfig {
    DriverConfig {
        step_timeout_secs: 120,
        poller: PollerConfig {
            interval_ms: 5,
            jitter_ms: 0,
            max_fetch_retries: 3,
            backoff_base_ms: 1,
        },
    }
}

fn redis_spec(name: &str, hosts: Vec<HostSpec>) -> ClusterSpec {
    ClusterSpec {
        name: name.into(),
        folder_id: "b1gfolder".into(),
        description: "Redis Cluster Test".into(),
        environment: Environment::Prestable,
        network_id: "enpnet".into(),
        labels: BTreeMap::from([("test_key".to_string(), "test_value".to_string())]),
        security_group_ids: BTreeSet::from(["sg-1".to_string()]),
        tls_enabled: true,
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
            disk_type_id: None,
        },
        maintenance_window: MaintenanceWindow::Weekly {
            day: WeekDay::Fri,
            hour: 20,
        },
        deletion_protection: false,
        sharded: hosts.iter().any(|h| h.shard_name.is_some()),
        hosts,
    }
}

fn host() -> HostSpec {
    HostSpec::new("ru-central1-c", "subnet-c")
}

fn shards(names: &[&str], per_shard: usize) -> Vec<HostSpec> {
    names
        .iter()
        .flat_map(|s| (0..per_shard).map(move |_| host().in_shard(*s)))
        .collect()
}

fn setup() -> (Arc<MemoryControlPlane>, ConvergenceDriver<MemoryControlPlane>) {
    init_test_tracing();
    let cp = Arc::new(MemoryControlPlane::new());
    let driver = ConvergenceDriver::new(cp.clone(), config());
    (cp, driver)
}

#[tokio::test(start_paused = true)]
async fn test_creates_missing_cluster_then_is_idempotent() {
    let (cp, driver) = setup();
    let spec = redis_spec("test-redis", vec![host()]);
    let cancel = CancellationToken::new();

    let res = driver.converge(&spec, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!((res.applied, res.total), (1, 1));
    let id = res.cluster_id.clone().unwrap();
    assert_eq!(cp.calls().await, vec!["create_cluster"]);

    let state = cp.cluster_state(&id).await.unwrap();
    assert_eq!(state.hosts.len(), 1);
    assert!(state.tls_enabled);

    let again = driver.converge(&spec, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(again.status, ConvergenceStatus::Succeeded);
    assert_eq!(again.total, 0);
    assert_eq!(cp.calls().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_grows_unsharded_cluster_and_updates_fields() {
    let (cp, driver) = setup();
    let id = cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;

    let mut spec = redis_spec("test-redis", vec![host(), HostSpec::new("ru-central1-a", "subnet-a")]);
    spec.description = "Redis Cluster Test Updated".into();
    spec.config.timeout = Some(200);
    spec.resources.resource_preset_id = "hm1.micro".into();
    spec.resources.disk_size_gb = 17;

    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(
        cp.calls().await,
        vec![
            "add_hosts",
            "update_cluster[description]",
            "update_cluster[config_spec.redis.timeout]",
            "update_cluster[config_spec.resources.resource_preset_id,config_spec.resources.disk_size]",
        ]
    );

    let state = cp.cluster_state(&id).await.unwrap();
    assert_eq!(state.hosts.len(), 2);
    assert_eq!(state.config.timeout, Some(200));
    assert_eq!(state.resources.disk_size_gb, 17);
}

#[tokio::test(start_paused = true)]
async fn test_swaps_a_shard_without_emptying_anything() {
    let (cp, driver) = setup();
    let id = cp
        .seed_cluster(&redis_spec("test-sharded", shards(&["first", "second", "third"], 2)))
        .await;
    let spec = redis_spec("test-sharded", shards(&["first", "second", "new"], 2));

    let plan = driver.plan(&spec).await.unwrap();
    assert_eq!(
        plan.kinds(),
        vec!["add_shard", "add_host", "remove_host", "remove_shard"]
    );

    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(
        cp.calls().await,
        vec!["add_shard", "add_hosts", "delete_hosts", "delete_shard"]
    );

    let state = cp.cluster_state(&id).await.unwrap();
    let names: Vec<&str> = state.shards.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second", "new"]);
    assert!(state.shards.iter().all(|s| s.host_count == 2));
}

#[tokio::test(start_paused = true)]
async fn test_protected_environment_change_is_vetoed_locally() {
    let (cp, driver) = setup();
    let mut seeded = redis_spec("test-redis", vec![host()]);
    seeded.deletion_protection = true;
    seeded.environment = Environment::Production;
    cp.seed_cluster(&seeded).await;

    let mut spec = seeded.clone();
    spec.environment = Environment::Prestable;
    let err = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ValidationRejected(GuardRejection::ProtectedResource { .. })
    ));
    assert!(cp.calls().await.is_empty());
    assert!(driver
        .metrics()
        .render()
        .contains("cirrus_engine_guard_rejections_total 1\n"));
}

#[tokio::test(start_paused = true)]
async fn test_protection_is_lifted_before_environment_change() {
    let (cp, driver) = setup();
    let mut seeded = redis_spec("test-redis", vec![host()]);
    seeded.deletion_protection = true;
    seeded.environment = Environment::Production;
    let id = cp.seed_cluster(&seeded).await;

    let spec = redis_spec("test-redis", vec![host()]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(
        cp.calls().await,
        vec![
            "update_cluster[deletion_protection]",
            "update_cluster[environment]"
        ]
    );
    let state = cp.cluster_state(&id).await.unwrap();
    assert_eq!(state.environment, Environment::Prestable);
    assert!(!state.deletion_protection);
}

#[tokio::test(start_paused = true)]
async fn test_remote_rejection_stops_and_rerun_finishes_the_rest() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;

    let mut spec = redis_spec("test-redis", vec![host(), host()]);
    spec.config.maxmemory_policy = Some("VOLATILE_LFU".into());
    spec.labels.insert("new_key".into(), "new_value".into());

    cp.reject_call(
        "update_cluster",
        RemoteStatus::new(StatusCode::FailedPrecondition, "invalid labels"),
    )
    .await;
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Failed);
    assert_eq!((res.applied, res.total), (1, 3));
    let outcomes: Vec<StepOutcome> = res.steps.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![StepOutcome::Applied, StepOutcome::Rejected, StepOutcome::Skipped]
    );
    assert!(matches!(
        res.failure,
        Some(EngineError::RemoteRejected { ref status, .. }) if status.message == "invalid labels"
    ));

    let remaining = driver.plan(&spec).await.unwrap();
    assert_eq!(remaining.kinds(), vec!["update_metadata", "update_config"]);

    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(res.applied, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_operation_is_a_remote_rejection() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    cp.fail_next_operation(RemoteStatus::new(StatusCode::Internal, "no capacity in zone"))
        .await;

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Failed);
    assert_eq!(res.applied, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_in_progress_and_never_doubles_up() {
    let (cp, driver) = setup();
    let id = cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    cp.stall_operations(true).await;

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::InProgress);
    assert!(matches!(
        res.failure,
        Some(EngineError::Timeout {
            operation_id: Some(_),
            ..
        })
    ));

    // The add is still running remotely: nothing new may be issued.
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::InProgress);
    assert_eq!(res.total, 0);
    assert_eq!(cp.calls().await, vec!["add_hosts"]);

    cp.stall_operations(false).await;
    cp.settle().await;
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(res.total, 0);
    assert_eq!(cp.cluster_state(&id).await.unwrap().hosts.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_create_still_reports_the_new_cluster() {
    let (cp, driver) = setup();
    cp.stall_operations(true).await;

    let spec = redis_spec("test-redis", vec![host()]);
    let res = driver
        .converge(&spec, Duration::from_secs(30), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::InProgress);

    let remote = cp.list_clusters("b1gfolder").await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(res.cluster_id.as_deref(), Some(remote[0].id.as_str()));
    assert!(res.steps[0].operation_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_converges() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, Duration::MAX, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(cp.calls().await, vec!["add_hosts"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_status_retries_report_in_progress() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    // One more than the configured retries.
    cp.transient_fetch_errors(config().poller.max_fetch_retries + 1)
        .await;

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::InProgress);
    assert_eq!(res.steps[0].outcome, StepOutcome::PollFailed);
    assert!(matches!(
        res.failure,
        Some(EngineError::PollFailed { attempts: 4, .. })
    ));
}

/// Hands out a fixed number of tokens, then reports the credential expired.
struct ExpiringToken(AtomicU32);

#[async_trait]
impl TokenProvider for ExpiringToken {
    async fn token(&self) -> Result<String, ApiError> {
        let left = self.0.load(Ordering::SeqCst);
        if left == 0 {
            return Err(ApiError::Unauthenticated("token expired".into()));
        }
        self.0.store(left - 1, Ordering::SeqCst);
        Ok("iam-token".into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_credentials_expiring_while_polling_fail_the_step() {
    let seeded = MemoryControlPlane::new();
    seeded.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    // list_clusters, get_cluster, list_hosts, list_shards, add_hosts.
    let cp = Arc::new(seeded.with_token_provider(Arc::new(ExpiringToken(AtomicU32::new(5)))));
    let driver = ConvergenceDriver::new(cp.clone(), config());

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Failed);
    assert_eq!(res.steps[0].outcome, StepOutcome::Failed);
    assert_eq!(
        res.failure,
        Some(EngineError::AuthFailure("token expired".into()))
    );
    assert_eq!(cp.calls().await, vec!["add_hosts"]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_status_errors_are_absorbed() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    cp.transient_fetch_errors(2).await;

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_waiting() {
    let (cp, driver) = setup();
    cp.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    cp.stall_operations(true).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let spec = redis_spec("test-redis", vec![host(), host()]);
    let res = driver.converge(&spec, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(res.status, ConvergenceStatus::Cancelled);
    assert_eq!(res.failure, Some(EngineError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_bad_credentials_fail_before_any_change() {
    let cp = Arc::new(MemoryControlPlane::new().with_token_provider(Arc::new(StaticToken::new(""))));
    let driver = ConvergenceDriver::new(cp.clone(), config());

    let err = driver
        .converge(&redis_spec("test-redis", vec![host()]), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthFailure(_)));
    assert!(cp.calls().await.is_empty());
}

/// Control plane that silently ignores label updates.
struct DropsLabels(MemoryControlPlane);

#[async_trait]
impl ClusterApi for DropsLabels {
    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster, ApiError> {
        self.0.get_cluster(cluster_id).await
    }

    async fn list_clusters(&self, folder_id: &str) -> Result<Vec<Cluster>, ApiError> {
        self.0.list_clusters(folder_id).await
    }

    async fn list_hosts(&self, cluster_id: &str) -> Result<Vec<Host>, ApiError> {
        self.0.list_hosts(cluster_id).await
    }

    async fn list_shards(&self, cluster_id: &str) -> Result<Vec<Shard>, ApiError> {
        self.0.list_shards(cluster_id).await
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Operation, ApiError> {
        self.0.create_cluster(spec).await
    }

    async fn update_cluster(&self, req: &UpdateClusterRequest) -> Result<Operation, ApiError> {
        let mut req = req.clone();
        req.labels = None;
        self.0.update_cluster(&req).await
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<Operation, ApiError> {
        self.0.delete_cluster(cluster_id).await
    }

    async fn add_hosts(&self, cluster_id: &str, hosts: &[HostSpec]) -> Result<Operation, ApiError> {
        self.0.add_hosts(cluster_id, hosts).await
    }

    async fn delete_hosts(&self, cluster_id: &str, fqdns: &[String]) -> Result<Operation, ApiError> {
        self.0.delete_hosts(cluster_id, fqdns).await
    }

    async fn add_shard(
        &self,
        cluster_id: &str,
        shard_name: &str,
        hosts: &[HostSpec],
    ) -> Result<Operation, ApiError> {
        self.0.add_shard(cluster_id, shard_name, hosts).await
    }

    async fn delete_shard(&self, cluster_id: &str, shard_name: &str) -> Result<Operation, ApiError> {
        self.0.delete_shard(cluster_id, shard_name).await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Operation, ApiError> {
        self.0.get_operation(operation_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_drift_after_apply_is_reported_as_divergence() {
    let api = Arc::new(DropsLabels(MemoryControlPlane::new()));
    api.0.seed_cluster(&redis_spec("test-redis", vec![host()])).await;
    let driver = ConvergenceDriver::new(api.clone(), config());

    let mut spec = redis_spec("test-redis", vec![host()]);
    spec.labels = BTreeMap::from([("new_key".to_string(), "new_value".to_string())]);
    let res = driver
        .converge(&spec, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Divergence);
    assert_eq!(res.applied, 1);
    assert_eq!(res.residual.kinds(), vec!["update_metadata"]);
    assert!(res.failure.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_independent_clusters_converge_concurrently() {
    let (cp, driver) = setup();
    let a = redis_spec("redis-a", vec![host()]);
    let b = redis_spec("redis-b", shards(&["first", "second"], 1));
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(
        driver.converge(&a, TIMEOUT, &cancel),
        driver.converge(&b, TIMEOUT, &cancel)
    );
    assert_eq!(ra.unwrap().status, ConvergenceStatus::Succeeded);
    assert_eq!(rb.unwrap().status, ConvergenceStatus::Succeeded);
    assert_eq!(cp.list_clusters("b1gfolder").await.unwrap().len(), 2);
}

fn sweep_config() -> SweepConfig {
    SweepConfig {
        attempts: 2,
        retry_delay_secs: 1,
        cluster_timeout_secs: 60,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_skips_protected_clusters() {
    let (cp, driver) = setup();
    let plain = cp.seed_cluster(&redis_spec("sweep-plain", vec![host()])).await;
    let mut protected = redis_spec("sweep-protected", vec![host()]);
    protected.deletion_protection = true;
    let protected = cp.seed_cluster(&protected).await;
    let mut elsewhere = redis_spec("other-folder", vec![host()]);
    elsewhere.folder_id = "b1gother".into();
    let elsewhere = cp.seed_cluster(&elsewhere).await;

    let sweeper = Sweeper::new(driver, sweep_config());
    let report = sweeper
        .sweep("b1gfolder", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.swept, vec![plain.clone()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, protected);
    assert!(matches!(
        report.failures[0].1,
        EngineError::ValidationRejected(GuardRejection::ProtectedResource { .. })
    ));
    assert!(cp.cluster_state(&plain).await.is_none());
    assert!(cp.cluster_state(&protected).await.is_some());
    assert!(cp.cluster_state(&elsewhere).await.is_some());
    assert!(report.into_result().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_retries_a_refused_delete() {
    let (cp, driver) = setup();
    let id = cp.seed_cluster(&redis_spec("sweep-me", vec![host()])).await;
    cp.reject_call(
        "delete_cluster",
        RemoteStatus::new(StatusCode::Unavailable, "try again later"),
    )
    .await;

    let report = Sweeper::new(driver, sweep_config())
        .sweep("b1gfolder", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.swept, vec![id.clone()]);
    assert_eq!(cp.calls().await, vec!["delete_cluster", "delete_cluster"]);
    assert!(cp.cluster_state(&id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_decommission_of_missing_cluster_succeeds() {
    let (_cp, driver) = setup();
    let res = driver
        .decommission("c9qmissing", TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(res.status, ConvergenceStatus::Succeeded);
    assert_eq!(res.total, 0);
}
