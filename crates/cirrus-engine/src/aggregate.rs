use crate::change::{ChangeSet, ChangeStep};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// The control plane refused the step, on submission or in the operation.
    Rejected,
    TimedOut,
    PollFailed,
    Cancelled,
    /// Failed on our side of the wire: credentials, transport, a guard veto
    /// on re-validation.
    Failed,
    /// Never attempted because an earlier step stopped the run.
    Skipped,
}

impl StepOutcome {
    pub fn from_error(e: &EngineError) -> Self {
        match e {
            EngineError::RemoteRejected { .. } => StepOutcome::Rejected,
            EngineError::Timeout { .. } => StepOutcome::TimedOut,
            EngineError::PollFailed { .. } => StepOutcome::PollFailed,
            EngineError::Cancelled => StepOutcome::Cancelled,
            EngineError::ValidationRejected(_)
            | EngineError::AuthFailure(_)
            | EngineError::Api(_) => StepOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub step: ChangeStep,
    pub outcome: StepOutcome,
    pub operation_id: Option<String>,
    pub error: Option<EngineError>,
}

impl StepReport {
    pub fn applied(index: usize, step: ChangeStep, operation_id: String) -> Self {
        Self {
            index,
            step,
            outcome: StepOutcome::Applied,
            operation_id: Some(operation_id),
            error: None,
        }
    }

    pub fn failed(index: usize, step: ChangeStep, error: EngineError) -> Self {
        Self {
            index,
            step,
            outcome: StepOutcome::from_error(&error),
            operation_id: None,
            error: Some(error),
        }
    }

    pub fn skipped(index: usize, step: ChangeStep) -> Self {
        Self {
            index,
            step,
            outcome: StepOutcome::Skipped,
            operation_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Succeeded,
    Failed,
    /// Something is still running remotely; converge again later.
    InProgress,
    Cancelled,
    /// Every step landed but the verification diff is not empty.
    Divergence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceResult {
    pub cluster_id: Option<String>,
    pub status: ConvergenceStatus,
    pub steps: Vec<StepReport>,
    pub applied: usize,
    pub total: usize,
    pub failure: Option<EngineError>,
    /// What the verification pass still found to do.
    pub residual: ChangeSet,
}

impl ConvergenceResult {
    /// The cluster is busy with an operation we did not start; nothing issued.
    pub fn in_progress(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            status: ConvergenceStatus::InProgress,
            steps: Vec::new(),
            applied: 0,
            total: 0,
            failure: None,
            residual: ChangeSet::new(),
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == ConvergenceStatus::Succeeded
    }

    pub fn remaining(&self) -> usize {
        self.total - self.applied
    }
}

/// Fold per-step reports into one result. Step order is kept and the first
/// failing step decides both the status and the reported failure.
pub fn aggregate(
    cluster_id: Option<String>,
    steps: Vec<StepReport>,
    residual: ChangeSet,
) -> ConvergenceResult {
    let applied = steps
        .iter()
        .filter(|r| r.outcome == StepOutcome::Applied)
        .count();
    let total = steps.len();

    let first_failure = steps.iter().find(|r| r.error.is_some());
    let (status, failure) = match first_failure {
        Some(report) => (status_of(report.outcome), report.error.clone()),
        None if !residual.is_empty() => (ConvergenceStatus::Divergence, None),
        None => (ConvergenceStatus::Succeeded, None),
    };

    ConvergenceResult {
        cluster_id,
        status,
        steps,
        applied,
        total,
        failure,
        residual,
    }
}

fn status_of(outcome: StepOutcome) -> ConvergenceStatus {
    match outcome {
        StepOutcome::TimedOut | StepOutcome::PollFailed => ConvergenceStatus::InProgress,
        StepOutcome::Cancelled => ConvergenceStatus::Cancelled,
        StepOutcome::Rejected | StepOutcome::Failed => ConvergenceStatus::Failed,
        StepOutcome::Applied | StepOutcome::Skipped => ConvergenceStatus::Succeeded,
    }
}
