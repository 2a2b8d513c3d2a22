//! Property-based tests for outcome classification.

use std::collections::BTreeSet;

use patchgrade::domain::models::{PhaseResults, TestOutcome, TestPhase, VerdictKind};
use patchgrade::services::classify;
use proptest::prelude::*;

fn outcome() -> impl Strategy<Value = TestOutcome> {
    prop_oneof![
        Just(TestOutcome::Pass),
        Just(TestOutcome::Fail),
        Just(TestOutcome::Error),
        Just(TestOutcome::NotRun),
    ]
}

/// Test ids split into fail_to_pass and pass_to_pass, with pre and post
/// outcomes for each.
fn scenario() -> impl Strategy<Value = (Vec<(TestOutcome, TestOutcome)>, Vec<(TestOutcome, TestOutcome)>)> {
    (
        prop::collection::vec((outcome(), outcome()), 1..6),
        prop::collection::vec((outcome(), outcome()), 0..6),
    )
}

fn build(
    f2p: &[(TestOutcome, TestOutcome)],
    p2p: &[(TestOutcome, TestOutcome)],
) -> (BTreeSet<String>, BTreeSet<String>, PhaseResults, PhaseResults) {
    let mut pre = PhaseResults::new(TestPhase::PrePatch);
    let mut post = PhaseResults::new(TestPhase::PostPatch);
    let mut f2p_ids = BTreeSet::new();
    let mut p2p_ids = BTreeSet::new();

    for (i, (before, after)) in f2p.iter().enumerate() {
        let id = format!("tests/test_fix.py::case_{i}");
        pre.outcomes.insert(id.clone(), *before);
        post.outcomes.insert(id.clone(), *after);
        f2p_ids.insert(id);
    }
    for (i, (before, after)) in p2p.iter().enumerate() {
        let id = format!("tests/test_keep.py::case_{i}");
        pre.outcomes.insert(id.clone(), *before);
        post.outcomes.insert(id.clone(), *after);
        p2p_ids.insert(id);
    }
    (f2p_ids, p2p_ids, pre, post)
}

proptest! {
    /// A patch that did not apply is never resolved, whatever the tests say.
    #[test]
    fn prop_unapplied_patch_never_resolves((f2p, p2p) in scenario()) {
        let (f2p_ids, p2p_ids, pre, post) = build(&f2p, &p2p);

        let with_post = classify(&f2p_ids, &p2p_ids, &pre, Some(&post), false);
        prop_assert!(!with_post.resolved);
        prop_assert_eq!(with_post.kind, VerdictKind::PatchRejected);

        let without_post = classify(&f2p_ids, &p2p_ids, &pre, None, false);
        prop_assert!(!without_post.resolved);
    }

    /// Resolved implies every listed test passes after the patch.
    #[test]
    fn prop_resolved_means_all_tests_pass((f2p, p2p) in scenario()) {
        let (f2p_ids, p2p_ids, pre, post) = build(&f2p, &p2p);
        let c = classify(&f2p_ids, &p2p_ids, &pre, Some(&post), true);

        let all_pass = f2p.iter().chain(p2p.iter()).all(|(_, after)| after.is_pass());
        prop_assert_eq!(c.resolved, all_pass);
        if c.resolved {
            prop_assert_eq!(c.kind, VerdictKind::Resolved);
            prop_assert!(c.fail_to_pass_results.values().all(|t| t.after.is_pass()));
            prop_assert!(c.pass_to_pass_results.values().all(|t| t.after.is_pass()));
        }
    }

    /// The baseline never changes whether an instance is resolved.
    #[test]
    fn prop_baseline_does_not_affect_resolution((f2p, p2p) in scenario(), flip in outcome()) {
        let (f2p_ids, p2p_ids, pre, post) = build(&f2p, &p2p);
        let mut altered = pre.clone();
        for value in altered.outcomes.values_mut() {
            *value = flip;
        }

        let original = classify(&f2p_ids, &p2p_ids, &pre, Some(&post), true);
        let rebased = classify(&f2p_ids, &p2p_ids, &altered, Some(&post), true);
        prop_assert_eq!(original.resolved, rebased.resolved);
    }

    /// Every listed test gets exactly one transition.
    #[test]
    fn prop_every_test_is_reported((f2p, p2p) in scenario(), applied in any::<bool>()) {
        let (f2p_ids, p2p_ids, pre, post) = build(&f2p, &p2p);
        let c = classify(&f2p_ids, &p2p_ids, &pre, Some(&post), applied);

        prop_assert_eq!(c.fail_to_pass_results.len(), f2p.len());
        prop_assert_eq!(c.pass_to_pass_results.len(), p2p.len());
        prop_assert_eq!(c.baseline_broken, !c.baseline_failures.is_empty());
    }
}
