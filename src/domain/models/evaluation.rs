//! Per-instance evaluation state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why an instance ended in [`EvaluationState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Environment acquisition or execution infrastructure failed.
    Infra(String),
    /// Dataset-provided setup commands or test patch failed.
    Setup(String),
    /// The pipeline panicked.
    Crashed(String),
    /// Writing the verdict failed.
    Reporting(String),
    /// Run-level cancellation interrupted the instance.
    Cancelled,
}

impl FailureReason {
    /// Whether an infra-error verdict should be recorded for this failure.
    ///
    /// Cancelled instances get no verdict so that a resumed run picks them up,
    /// and reporting failures abort the run instead.
    pub fn records_verdict(&self) -> bool {
        matches!(self, Self::Infra(_) | Self::Setup(_) | Self::Crashed(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infra(msg) => write!(f, "infra: {msg}"),
            Self::Setup(msg) => write!(f, "setup: {msg}"),
            Self::Crashed(msg) => write!(f, "crashed: {msg}"),
            Self::Reporting(msg) => write!(f, "reporting: {msg}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Lifecycle of one instance inside a run.
///
/// ```text
/// queued → environment_acquiring → baseline_testing → patching → testing
///        → classifying → reporting → done
/// ```
/// `patching → classifying` skips the post-patch run when the patch is
/// rejected. `failed(reason)` is reachable from every non-terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationState {
    #[default]
    Queued,
    EnvironmentAcquiring,
    BaselineTesting,
    Patching,
    Testing,
    Classifying,
    Reporting,
    Done,
    Failed(FailureReason),
}

impl EvaluationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::EnvironmentAcquiring => "environment_acquiring",
            Self::BaselineTesting => "baseline_testing",
            Self::Patching => "patching",
            Self::Testing => "testing",
            Self::Classifying => "classifying",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed(_)) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Queued, Self::EnvironmentAcquiring)
                | (Self::EnvironmentAcquiring, Self::BaselineTesting)
                | (Self::BaselineTesting, Self::Patching)
                | (Self::Patching, Self::Testing | Self::Classifying)
                | (Self::Testing, Self::Classifying)
                | (Self::Classifying, Self::Reporting)
                | (Self::Reporting, Self::Done)
        )
    }
}

impl fmt::Display for EvaluationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_valid() {
        let path = [
            EvaluationState::Queued,
            EvaluationState::EnvironmentAcquiring,
            EvaluationState::BaselineTesting,
            EvaluationState::Patching,
            EvaluationState::Testing,
            EvaluationState::Classifying,
            EvaluationState::Reporting,
            EvaluationState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejected_patch_skips_testing() {
        assert!(EvaluationState::Patching.can_transition_to(&EvaluationState::Classifying));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        let failed = EvaluationState::Failed(FailureReason::Cancelled);
        assert!(EvaluationState::Queued.can_transition_to(&failed));
        assert!(EvaluationState::Reporting.can_transition_to(&failed));
        assert!(!EvaluationState::Done.can_transition_to(&failed));
        assert!(!failed.can_transition_to(&EvaluationState::Queued));
    }

    #[test]
    fn test_no_skipping_acquisition() {
        assert!(!EvaluationState::Queued.can_transition_to(&EvaluationState::Patching));
        assert!(!EvaluationState::Testing.can_transition_to(&EvaluationState::Done));
    }

    #[test]
    fn test_cancelled_records_no_verdict() {
        assert!(!FailureReason::Cancelled.records_verdict());
        assert!(!FailureReason::Reporting("disk full".into()).records_verdict());
        assert!(FailureReason::Infra("gone".into()).records_verdict());
    }
}
