//! Outcome classification: pure mapping from test outcomes to a verdict.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::models::{PhaseResults, TestOutcome, TestTransition, VerdictKind};

/// Classified result for one instance, before it becomes a [`Verdict`].
///
/// [`Verdict`]: crate::domain::models::Verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: VerdictKind,
    pub patch_applied: bool,
    pub resolved: bool,
    pub fail_to_pass_results: BTreeMap<String, TestTransition>,
    pub pass_to_pass_results: BTreeMap<String, TestTransition>,
    /// The baseline already failed pass_to_pass tests.
    pub baseline_broken: bool,
    pub baseline_failures: Vec<String>,
}

fn transitions(
    tests: &BTreeSet<String>,
    pre: &PhaseResults,
    post: Option<&PhaseResults>,
) -> BTreeMap<String, TestTransition> {
    tests
        .iter()
        .map(|id| {
            let after = post.map_or(TestOutcome::NotRun, |p| p.get(id));
            (id.clone(), TestTransition::new(pre.get(id), after))
        })
        .collect()
}

/// Classify one evaluation.
///
/// `resolved` requires an applied patch, a post-patch run, and every
/// fail_to_pass and pass_to_pass test passing after the patch. The baseline
/// only decides whether an unresolved instance is flagged `baseline_broken`,
/// and never when the baseline phase itself was aborted (timeout, crash).
pub fn classify(
    fail_to_pass: &BTreeSet<String>,
    pass_to_pass: &BTreeSet<String>,
    pre: &PhaseResults,
    post: Option<&PhaseResults>,
    patch_applied: bool,
) -> Classification {
    let fail_to_pass_results = transitions(fail_to_pass, pre, post);
    let pass_to_pass_results = transitions(pass_to_pass, pre, post);

    let resolved = patch_applied
        && post.is_some()
        && fail_to_pass_results.values().all(|t| t.after.is_pass())
        && pass_to_pass_results.values().all(|t| t.after.is_pass());

    // An aborted baseline phase says nothing about the dataset.
    let baseline_failures: Vec<String> = if pre.error.is_some() {
        Vec::new()
    } else {
        pass_to_pass_results
            .iter()
            .filter(|(_, t)| matches!(t.before, TestOutcome::Fail | TestOutcome::Error))
            .map(|(id, _)| id.clone())
            .collect()
    };
    let baseline_broken = !baseline_failures.is_empty();

    let kind = if !patch_applied {
        VerdictKind::PatchRejected
    } else if resolved {
        VerdictKind::Resolved
    } else if baseline_broken {
        VerdictKind::BaselineBroken
    } else {
        VerdictKind::Unresolved
    };

    Classification {
        kind,
        patch_applied,
        resolved,
        fail_to_pass_results,
        pass_to_pass_results,
        baseline_broken,
        baseline_failures,
    }
}
