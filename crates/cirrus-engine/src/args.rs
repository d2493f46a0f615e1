use std::time::Duration;

use crate::driver::DriverConfig;
use crate::poller::PollerConfig;
use crate::sweeper::SweepConfig;

/// Engine knobs for binaries that embed the engine; `#[command(flatten)]`
/// them into the binary's own `Args`.
#[derive(Debug, Clone, clap::Args)]
pub struct EngineArgs {
    /// Overall budget of one convergence call.
    #[arg(long, env = "CIRRUS_CONVERGE_TIMEOUT_SECS", default_value_t = 5_400)]
    pub converge_timeout_secs: u64,

    #[arg(long, env = "CIRRUS_STEP_TIMEOUT_SECS", default_value_t = 3_600)]
    pub step_timeout_secs: u64,

    #[arg(long, env = "CIRRUS_POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "CIRRUS_POLL_JITTER_MS", default_value_t = 500)]
    pub poll_jitter_ms: u64,

    #[arg(long, env = "CIRRUS_POLL_FETCH_RETRIES", default_value_t = 5)]
    pub poll_fetch_retries: u32,

    #[arg(long, env = "CIRRUS_POLL_BACKOFF_MS", default_value_t = 250)]
    pub poll_backoff_ms: u64,

    #[arg(long, env = "CIRRUS_SWEEP_ATTEMPTS", default_value_t = 3)]
    pub sweep_attempts: u32,

    #[arg(long, env = "CIRRUS_SWEEP_RETRY_DELAY_SECS", default_value_t = 10)]
    pub sweep_retry_delay_secs: u64,
}

impl EngineArgs {
    pub fn converge_timeout(&self) -> Duration {
        Duration::from_secs(self.converge_timeout_secs)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            step_timeout_secs: self.step_timeout_secs,
            poller: PollerConfig {
                interval_ms: self.poll_interval_ms,
                jitter_ms: self.poll_jitter_ms,
                max_fetch_retries: self.poll_fetch_retries,
                backoff_base_ms: self.poll_backoff_ms,
            },
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            attempts: self.sweep_attempts,
            retry_delay_secs: self.sweep_retry_delay_secs,
            cluster_timeout_secs: self.converge_timeout_secs,
        }
    }
}
