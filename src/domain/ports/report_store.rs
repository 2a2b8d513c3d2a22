//! Report store port - persistence for verdicts.

use async_trait::async_trait;

use crate::domain::errors::ReportError;
use crate::domain::models::{RunManifest, Verdict};

/// Whether `key` can name a run or instance on disk: ASCII alphanumerics,
/// `-`, `_` and `.`, not starting with a dot.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Persists one immutable verdict per instance per run.
///
/// Writes are keyed by instance id and must be atomic: a reader sees either
/// no verdict or the complete one.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Create or validate the run's manifest.
    ///
    /// Fails when the run id already holds reports that cannot be merged with
    /// this invocation, unless `rewrite` is set.
    async fn prepare_run(&self, manifest: &RunManifest, rewrite: bool) -> Result<(), ReportError>;

    async fn has_report(&self, run_id: &str, instance_id: &str) -> Result<bool, ReportError>;

    async fn read(&self, run_id: &str, instance_id: &str) -> Result<Option<Verdict>, ReportError>;

    async fn write(&self, run_id: &str, instance_id: &str, verdict: &Verdict) -> Result<(), ReportError>;

    /// Store a supporting file (patch, test output) for an instance.
    async fn write_artifact(
        &self,
        run_id: &str,
        instance_id: &str,
        name: &str,
        contents: &str,
    ) -> Result<(), ReportError>;

    async fn read_all(&self, run_id: &str) -> Result<Vec<Verdict>, ReportError>;

    async fn read_manifest(&self, run_id: &str) -> Result<Option<RunManifest>, ReportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(is_valid_key("django__django-11099"));
        assert!(is_valid_key("sympy__sympy-20590.v2"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("../etc"));
        assert!(!is_valid_key(".hidden"));
        assert!(!is_valid_key("a/b"));
        assert!(!is_valid_key("a b"));
    }
}
