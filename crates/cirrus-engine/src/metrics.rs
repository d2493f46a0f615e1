use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregate::{ConvergenceResult, ConvergenceStatus, StepOutcome};

/// Engine counters, safe for concurrent access from many convergences.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Convergence and decommission calls.
    pub converge_total: AtomicU64,
    /// Calls that ended in `Failed` or returned an error.
    pub converge_failed_total: AtomicU64,
    /// Calls that ended `InProgress`.
    pub converge_in_progress_total: AtomicU64,
    /// Steps whose operation finished successfully.
    pub steps_applied_total: AtomicU64,
    /// Steps the control plane refused.
    pub remote_rejections_total: AtomicU64,
    /// Steps that ran out of time or lost track of their operation.
    pub step_timeouts_total: AtomicU64,
    /// Change sets vetoed by the safety guard.
    pub guard_rejections_total: AtomicU64,
    /// Verification passes that found drift.
    pub divergence_total: AtomicU64,
}

impl SharedMetrics {
    /// Account for a finished convergence.
    pub fn observe(&self, result: &ConvergenceResult) {
        for report in &result.steps {
            match report.outcome {
                StepOutcome::Applied => inc(&self.steps_applied_total),
                StepOutcome::Rejected => inc(&self.remote_rejections_total),
                StepOutcome::TimedOut | StepOutcome::PollFailed => inc(&self.step_timeouts_total),
                _ => {}
            }
        }
        match result.status {
            ConvergenceStatus::Failed => inc(&self.converge_failed_total),
            ConvergenceStatus::InProgress => inc(&self.converge_in_progress_total),
            ConvergenceStatus::Divergence => inc(&self.divergence_total),
            ConvergenceStatus::Succeeded | ConvergenceStatus::Cancelled => {}
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 8] = [
            ("converge_total", "Convergence calls.", &self.converge_total),
            ("converge_failed_total", "Convergence calls that failed.", &self.converge_failed_total),
            (
                "converge_in_progress_total",
                "Convergence calls left in progress.",
                &self.converge_in_progress_total,
            ),
            ("steps_applied_total", "Change steps applied.", &self.steps_applied_total),
            (
                "remote_rejections_total",
                "Change steps rejected by the control plane.",
                &self.remote_rejections_total,
            ),
            (
                "step_timeouts_total",
                "Change steps that timed out or lost their operation.",
                &self.step_timeouts_total,
            ),
            (
                "guard_rejections_total",
                "Change sets vetoed by the safety guard.",
                &self.guard_rejections_total,
            ),
            ("divergence_total", "Verification passes that found drift.", &self.divergence_total),
        ];

        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!(
                "# HELP cirrus_engine_{name} {help}\n\
                 # TYPE cirrus_engine_{name} counter\n\
                 cirrus_engine_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        body
    }
}

pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
