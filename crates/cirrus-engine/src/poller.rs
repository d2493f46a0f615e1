use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cirrus_api::{ApiError, ClusterApi, Operation, OperationOutcome, RemoteStatus};

/// Upper bound for a single fetch backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Stand-in for "no deadline", about 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + budget`, saturating to a far-future instant instead of
/// overflowing when the budget is effectively unbounded.
pub fn deadline_after(from: Instant, budget: Duration) -> Instant {
    from.checked_add(budget)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Pause between status fetches.
    pub interval_ms: u64,
    /// Random extra delay added to each pause, drawn from `[0, jitter_ms]`.
    pub jitter_ms: u64,
    /// Transient fetch failures tolerated in a row before giving up.
    pub max_fetch_retries: u32,
    /// First retry delay after a failed fetch; doubles on every retry.
    pub backoff_base_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            jitter_ms: 500,
            max_fetch_retries: 5,
            backoff_base_ms: 250,
        }
    }
}

/// How waiting on an operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Done { resource_id: String },
    /// The operation finished with an error payload.
    Failed(RemoteStatus),
    /// The deadline elapsed while the operation was still running.
    Timeout { waited: Duration },
    PollFailed { attempts: u32, error: ApiError },
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct OperationPoller {
    cfg: PollerConfig,
}

impl OperationPoller {
    pub fn new(cfg: PollerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.cfg
    }

    /// Poll `op` until it is done, `deadline` passes, or `cancel` fires.
    ///
    /// Never returns `Timeout` before `deadline`; every sleep is capped at it,
    /// so the call returns no later than one fetch after the deadline.
    /// Cancellation interrupts both the sleep and an in-flight fetch.
    pub async fn await_operation<A: ClusterApi + ?Sized>(
        &self,
        api: &A,
        op: &Operation,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> OperationResult {
        if op.done {
            return settled(op);
        }

        let started = Instant::now();
        let mut failures: u32 = 0;
        let mut wait = self.tick();

        loop {
            let wake = deadline_after(Instant::now(), wait).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return OperationResult::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                return OperationResult::Timeout {
                    waited: started.elapsed(),
                };
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return OperationResult::Cancelled,
                r = tokio::time::timeout_at(deadline, api.get_operation(&op.id)) => r,
            };

            match fetched {
                Err(_elapsed) => {
                    return OperationResult::Timeout {
                        waited: started.elapsed(),
                    };
                }
                Ok(Ok(current)) => {
                    if current.done {
                        return settled(&current);
                    }
                    failures = 0;
                    wait = self.tick();
                    debug!(operation_id = %op.id, description = %op.description, "operation still running");
                }
                Ok(Err(e)) if e.is_transient() && failures < self.cfg.max_fetch_retries => {
                    failures += 1;
                    wait = self.backoff(failures);
                    warn!(
                        operation_id = %op.id,
                        attempt = failures,
                        error = %e,
                        "operation status fetch failed, retrying"
                    );
                }
                Ok(Err(e)) => {
                    return OperationResult::PollFailed {
                        attempts: failures + 1,
                        error: e,
                    };
                }
            }
        }
    }

    fn tick(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.cfg.jitter_ms);
        Duration::from_millis(self.cfg.interval_ms.saturating_add(jitter))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (Duration::from_millis(self.cfg.backoff_base_ms) * factor).min(MAX_BACKOFF)
    }
}

fn settled(op: &Operation) -> OperationResult {
    match &op.outcome {
        Some(OperationOutcome::Error(status)) => OperationResult::Failed(status.clone()),
        Some(OperationOutcome::Response { resource_id }) => OperationResult::Done {
            resource_id: resource_id.clone(),
        },
        None => OperationResult::Done {
            resource_id: op.cluster_id.clone(),
        },
    }
}
