//! Common test utilities for integration tests
//!
//! Provides shared fixtures and helpers used across multiple integration
//! test files.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use patchgrade::domain::models::{EvaluationConfig, Prediction, TaskInstance};
use patchgrade::services::{
    select_instances, Evaluator, PredictionSet, RetryPolicy, RunPlan, Scheduler,
};
use patchgrade::{FsReportStore, MockEnvironmentProvider, ReportStore};

pub const RUN_ID: &str = "test-run";

pub const F2P: &str = "tests/test_app.py::test_fix";
pub const P2P: &str = "tests/test_app.py::test_existing";

/// A patch that passes structural inspection.
pub const VALID_PATCH: &str = "diff --git a/src/app.py b/src/app.py
--- a/src/app.py
+++ b/src/app.py
@@ -1,1 +1,1 @@
-x = 1
+x = 2
";

/// Create a temporary directory for test isolation
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Instance with one fail_to_pass and one pass_to_pass test.
pub fn instance(id: &str) -> TaskInstance {
    TaskInstance::new(id, "octo/app", "0123abcd")
        .with_fail_to_pass([F2P])
        .with_pass_to_pass([P2P])
}

pub fn prediction(id: &str) -> Prediction {
    Prediction::new(id, VALID_PATCH)
}

/// pytest `-rA` summary lines.
pub fn pytest_output(results: &[(&str, &str)]) -> String {
    results
        .iter()
        .map(|(status, id)| format!("{status} {id}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Baseline: the target test fails, the existing test passes.
pub fn baseline_output() -> String {
    pytest_output(&[("FAILED", F2P), ("PASSED", P2P)])
}

/// Everything passes.
pub fn fixed_output() -> String {
    pytest_output(&[("PASSED", F2P), ("PASSED", P2P)])
}

/// Millisecond-scale retries so transient failures do not slow tests down.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1, 5).with_jitter(0.0)
}

pub fn evaluation_config() -> EvaluationConfig {
    EvaluationConfig {
        test_timeout_secs: 30,
        command_timeout_secs: 10,
        retry_infra_errors: false,
    }
}

/// A scheduler over `provider` and `store`.
pub fn scheduler(
    provider: Arc<MockEnvironmentProvider>,
    store: Arc<dyn ReportStore>,
    max_workers: usize,
) -> Scheduler {
    let evaluator = Evaluator::new(provider, Arc::clone(&store), fast_retry(), &evaluation_config());
    Scheduler::new(Arc::new(evaluator), store, max_workers)
}

/// Filesystem store rooted in `dir`.
pub fn fs_store(dir: &TempDir) -> Arc<FsReportStore> {
    Arc::new(FsReportStore::new(dir.path().join("reports")))
}

/// Plan covering every instance, each with its prediction.
pub fn plan(instances: &[TaskInstance], predictions: Vec<Prediction>) -> RunPlan {
    let predictions = PredictionSet::from_predictions(predictions);
    let selection = select_instances(instances, &predictions, None);
    RunPlan::new(RUN_ID, "fixtures", "test", instances, &predictions, &selection)
}
