//! Verdicts and run manifests, the persisted results of a run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::TestTransition;

/// Bumped whenever the on-disk verdict shape changes incompatibly.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Summary category of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Resolved,
    /// Patch applied, tests did not all pass.
    Unresolved,
    /// Empty, malformed, or non-applying patch.
    PatchRejected,
    /// Evaluation could not reach a classification.
    InfraError,
    /// Unresolved, and the baseline already failed pass_to_pass tests.
    BaselineBroken,
}

impl VerdictKind {
    pub const ALL: [Self; 5] = [
        Self::Resolved,
        Self::Unresolved,
        Self::PatchRejected,
        Self::InfraError,
        Self::BaselineBroken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
            Self::PatchRejected => "patch_rejected",
            Self::InfraError => "infra_error",
            Self::BaselineBroken => "baseline_broken",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification and evidence for one instance in one run.
///
/// Written once, after the instance's environment has been released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub schema_version: u32,
    pub instance_id: String,
    pub run_id: String,
    pub model_name_or_path: String,
    pub kind: VerdictKind,
    pub patch_applied: bool,
    pub resolved: bool,
    pub fail_to_pass_results: BTreeMap<String, TestTransition>,
    pub pass_to_pass_results: BTreeMap<String, TestTransition>,
    /// The pre-patch run already failed pass_to_pass tests.
    pub baseline_broken: bool,
    #[serde(default)]
    pub baseline_failures: Vec<String>,
    /// Output of the patch application attempt.
    #[serde(default)]
    pub patch_detail: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Number of environment acquisition attempts.
    pub provision_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Verdict {
    /// Verdict for an instance whose evaluation failed before classification.
    pub fn infra_error(
        run_id: impl Into<String>,
        instance_id: impl Into<String>,
        model_name_or_path: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            instance_id: instance_id.into(),
            run_id: run_id.into(),
            model_name_or_path: model_name_or_path.into(),
            kind: VerdictKind::InfraError,
            patch_applied: false,
            resolved: false,
            fail_to_pass_results: BTreeMap::new(),
            pass_to_pass_results: BTreeMap::new(),
            baseline_broken: false,
            baseline_failures: Vec::new(),
            patch_detail: None,
            error: Some(error.into()),
            provision_attempts: 0,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// Per-run metadata stored next to the verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub dataset: String,
    pub split: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Instances selected by the latest invocation for this run id.
    #[serde(default)]
    pub selected: Vec<String>,
}

impl RunManifest {
    pub fn new(
        run_id: impl Into<String>,
        dataset: impl Into<String>,
        split: impl Into<String>,
        selected: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: run_id.into(),
            dataset: dataset.into(),
            split: split.into(),
            created_at: now,
            updated_at: now,
            selected,
        }
    }

    /// `dataset:split`, as shown in incompatibility diagnostics.
    pub fn source_label(&self) -> String {
        format!("{}:{}", self.dataset, self.split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infra_error_verdict_is_never_resolved() {
        let v = Verdict::infra_error("run", "x-1", "model", "acquire failed", Utc::now());
        assert_eq!(v.kind, VerdictKind::InfraError);
        assert!(!v.resolved);
        assert!(!v.patch_applied);
        assert_eq!(v.schema_version, REPORT_SCHEMA_VERSION);
    }

    #[test]
    fn test_verdict_roundtrips_through_json() {
        let v = Verdict::infra_error("run", "x-1", "model", "boom", Utc::now());
        let json = serde_json::to_string_pretty(&v).unwrap();
        assert!(json.contains("\"kind\": \"infra_error\""));
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
