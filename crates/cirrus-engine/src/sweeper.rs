use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cirrus_api::ClusterApi;

use crate::driver::ConvergenceDriver;
use crate::error::EngineError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Decommission attempts per cluster.
    pub attempts: u32,
    pub retry_delay_secs: u64,
    /// Budget for one decommission attempt.
    pub cluster_timeout_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_secs: 10,
            cluster_timeout_secs: 900,
        }
    }
}

impl SweepConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub swept: Vec<String>,
    pub failures: Vec<(String, EngineError)>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse the per-cluster failures into a single error.
    pub fn into_result(self) -> anyhow::Result<Vec<String>> {
        if self.failures.is_empty() {
            return Ok(self.swept);
        }
        let details: Vec<String> = self
            .failures
            .iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect();
        Err(anyhow!(
            "{} cluster(s) could not be swept: {}",
            self.failures.len(),
            details.join("; ")
        ))
    }
}

/// Deletes every cluster of a folder through the convergence driver, so the
/// same guard applies: protected clusters stay.
pub struct Sweeper<A: ?Sized> {
    driver: ConvergenceDriver<A>,
    cfg: SweepConfig,
}

impl<A: ClusterApi + ?Sized> Sweeper<A> {
    pub fn new(driver: ConvergenceDriver<A>, cfg: SweepConfig) -> Self {
        Self { driver, cfg }
    }

    /// Try every cluster in `folder_id`; one failure does not stop the rest.
    pub async fn sweep(&self, folder_id: &str, cancel: &CancellationToken) -> Result<SweepReport, EngineError> {
        let clusters = self.driver.api().list_clusters(folder_id).await?;
        info!(folder_id, count = clusters.len(), "sweeping clusters");

        let mut report = SweepReport::default();
        for cluster in clusters {
            match self.sweep_one(&cluster.id, cancel).await {
                Ok(()) => report.swept.push(cluster.id),
                Err(e) => {
                    warn!(cluster_id = %cluster.id, cluster = %cluster.name, error = %e, "sweep failed");
                    report.failures.push((cluster.id, e));
                }
            }
        }
        Ok(report)
    }

    async fn sweep_one(&self, cluster_id: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        let attempts = self.cfg.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self
                .driver
                .decommission(cluster_id, self.cfg.cluster_timeout(), cancel)
                .await
            {
                Ok(res) if res.is_converged() => return Ok(()),
                Ok(res) => res.failure.unwrap_or(EngineError::Timeout {
                    operation_id: None,
                    waited: self.cfg.cluster_timeout(),
                }),
                Err(e) => e,
            };
            if matches!(err, EngineError::ValidationRejected(_) | EngineError::Cancelled) {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(err);
            }

            warn!(cluster_id, attempt, error = %err, "decommission failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.cfg.retry_delay()) => {}
            }
            attempt += 1;
        }
    }
}
