//! Environment provider port - interface for isolated execution contexts.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EnvironmentError;

/// What an environment must be built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
}

/// A live environment bound to exactly one in-flight evaluation.
///
/// Not `Clone`: [`EnvironmentProvider::release`] consumes the handle, so a
/// handle cannot be released twice or used afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub id: Uuid,
    pub instance_id: String,
    /// Repository checkout at `base_commit`; commands run here.
    pub workdir: String,
    /// Private directory for harness files (patches), never shared.
    pub scratch_dir: String,
}

impl EnvironmentHandle {
    pub fn new(
        instance_id: impl Into<String>,
        workdir: impl Into<String>,
        scratch_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, the way patch and setup diagnostics are kept.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Capability that provisions isolated, reproducible execution contexts.
///
/// Implementations own capacity management; the scheduler never holds more
/// than `max_workers` handles at once.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Provision a context checked out at `spec.base_commit`.
    async fn acquire(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, EnvironmentError>;

    /// Run a shell command inside the context's `workdir`.
    ///
    /// Exceeding `timeout` yields [`EnvironmentError::Timeout`]; a non-zero
    /// exit status is a normal [`ExecOutput`].
    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, EnvironmentError>;

    /// Destroy the context.
    async fn release(&self, handle: EnvironmentHandle) -> Result<(), EnvironmentError>;
}
