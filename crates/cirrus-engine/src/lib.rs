//! Reconciliation engine for managed Redis clusters: diff the desired spec
//! against the control plane, veto unsafe change sets, and drive the rest
//! through long-running operations one step at a time.

pub mod aggregate;
pub mod args;
pub mod change;
pub mod differ;
pub mod driver;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod poller;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use aggregate::{aggregate, ConvergenceResult, ConvergenceStatus, StepOutcome, StepReport};
pub use args::EngineArgs;
pub use change::{ChangeSet, ChangeStep};
pub use differ::{diff, plan_creation, plan_deletion};
pub use driver::{ConvergenceDriver, DriverConfig};
pub use error::{EngineError, GuardRejection};
pub use guard::validate;
pub use metrics::SharedMetrics;
pub use poller::{OperationPoller, OperationResult, PollerConfig};
pub use sweeper::{SweepConfig, SweepReport, Sweeper};
