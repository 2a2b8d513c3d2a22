//! Per-test outcomes for the two test phases.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of one test identifier in one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    /// The harness could not obtain a result (timeout, crash, setup failure).
    Error,
    /// The test id never appeared in the test output.
    #[default]
    NotRun,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::NotRun => "not_run",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the patch a test run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    /// Baseline run on the untouched checkout.
    PrePatch,
    PostPatch,
}

impl TestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrePatch => "pre_patch",
            Self::PostPatch => "post_patch",
        }
    }

    /// File suffix used for the captured test output artifact.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Self::PrePatch => "test_output.pre.txt",
            Self::PostPatch => "test_output.post.txt",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcomes of one phase, keyed by test id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResults {
    pub phase: Option<TestPhase>,
    pub outcomes: BTreeMap<String, TestOutcome>,
    /// Set when the whole phase was aborted (timeout, crash).
    pub error: Option<String>,
    /// Raw test output, kept for the per-instance artifact.
    #[serde(skip)]
    pub raw_output: String,
}

impl PhaseResults {
    pub fn new(phase: TestPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// Every requested test marked with the same outcome. Used when a phase
    /// could not produce per-test results.
    pub fn uniform<'a, I>(phase: TestPhase, tests: I, outcome: TestOutcome, error: Option<String>) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        Self {
            phase: Some(phase),
            outcomes: tests.into_iter().map(|t| (t.clone(), outcome)).collect(),
            error,
            raw_output: String::new(),
        }
    }

    /// Outcome for a test id; ids absent from the map were never run.
    pub fn get(&self, test_id: &str) -> TestOutcome {
        self.outcomes.get(test_id).copied().unwrap_or(TestOutcome::NotRun)
    }
}

/// How one test moved from the baseline to the patched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTransition {
    pub before: TestOutcome,
    pub after: TestOutcome,
}

impl TestTransition {
    pub fn new(before: TestOutcome, after: TestOutcome) -> Self {
        Self { before, after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_ids_are_not_run() {
        let mut results = PhaseResults::new(TestPhase::PostPatch);
        results.outcomes.insert("a".into(), TestOutcome::Fail);

        assert_eq!(results.get("a"), TestOutcome::Fail);
        assert_eq!(results.get("b"), TestOutcome::NotRun);
    }

    #[test]
    fn test_uniform_marks_every_test() {
        let tests = vec!["a".to_string(), "b".to_string()];
        let results = PhaseResults::uniform(
            TestPhase::PrePatch,
            &tests,
            TestOutcome::Error,
            Some("timed out".into()),
        );
        assert!(results.outcomes.values().all(|o| *o == TestOutcome::Error));
        assert_eq!(results.outcomes.len(), 2);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&TestOutcome::NotRun).unwrap();
        assert_eq!(json, "\"not_run\"");
    }
}
