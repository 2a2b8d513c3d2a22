//! Per-instance evaluation pipeline.
//!
//! acquire → setup → baseline tests → patch → post-patch tests → classify →
//! release → report. The environment is released on every exit path,
//! including errors, panics and cancellation, and before any verdict is
//! written.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::errors::{EnvironmentError, ReportError};
use crate::domain::models::{
    EvaluationConfig, EvaluationState, FailureReason, PhaseResults, Prediction, TaskInstance,
    TestOutcome, TestPhase, Verdict, VerdictKind, REPORT_SCHEMA_VERSION,
};
use crate::domain::ports::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, ReportStore};
use crate::services::outcome_classifier::{classify, Classification};
use crate::services::patch_applicator::{ApplyResult, PatchApplicator, MODEL_PATCH_FILE, TEST_PATCH_FILE};
use crate::services::retry::RetryPolicy;
use crate::services::run_state::RunState;
use crate::services::test_runner::TestRunner;

/// Name of the stored candidate patch artifact.
pub const PATCH_ARTIFACT: &str = "patch.diff";

/// Timestamped transcript of what the pipeline did for one instance.
pub const INSTANCE_LOG_ARTIFACT: &str = "run_instance.log";

/// How one instance ended.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub instance_id: String,
    /// The written verdict; `None` when the instance was cancelled.
    pub verdict: Option<Verdict>,
    pub failure: Option<FailureReason>,
}

impl InstanceOutcome {
    pub fn kind(&self) -> Option<VerdictKind> {
        self.verdict.as_ref().map(|v| v.kind)
    }
}

/// Why the pipeline stopped before classification.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed(FailureReason),
}

impl From<EnvironmentError> for Halt {
    fn from(err: EnvironmentError) -> Self {
        match err {
            EnvironmentError::Setup(msg) => Self::Failed(FailureReason::Setup(msg)),
            other => Self::Failed(FailureReason::Infra(other.to_string())),
        }
    }
}

/// Evidence gathered while the environment is held.
#[derive(Debug, Default)]
struct Collected {
    pre: Option<PhaseResults>,
    post: Option<PhaseResults>,
    apply: Option<ApplyResult>,
    classification: Option<Classification>,
    transcript: Vec<String>,
}

impl Collected {
    fn note(&mut self, line: impl AsRef<str>) {
        self.transcript
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), line.as_ref()));
    }

    fn note_phase(&mut self, results: &PhaseResults) {
        let passed = results.outcomes.values().filter(|o| o.is_pass()).count();
        let phase = results.phase.map_or("tests", |p| p.as_str());
        let mut line = format!("{phase}: {passed}/{} passed", results.outcomes.len());
        if let Some(err) = &results.error {
            line.push_str(&format!(" (aborted: {err})"));
        }
        self.note(line);
    }
}

/// Evaluates single instances. Shared by all workers of a run.
pub struct Evaluator {
    provider: Arc<dyn EnvironmentProvider>,
    store: Arc<dyn ReportStore>,
    retry: RetryPolicy,
    patcher: PatchApplicator,
    runner: TestRunner,
    command_timeout: Duration,
}

impl Evaluator {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        store: Arc<dyn ReportStore>,
        retry: RetryPolicy,
        config: &EvaluationConfig,
    ) -> Self {
        let command_timeout = Duration::from_secs(config.command_timeout_secs);
        Self {
            patcher: PatchApplicator::new(Arc::clone(&provider), retry.clone(), command_timeout),
            runner: TestRunner::new(
                Arc::clone(&provider),
                retry.clone(),
                Duration::from_secs(config.test_timeout_secs),
            ),
            provider,
            store,
            retry,
            command_timeout,
        }
    }

    /// Evaluate one instance and persist its verdict.
    ///
    /// Per-instance failures are recorded in the outcome; only a report
    /// store failure comes back as `Err`.
    #[instrument(skip_all, fields(run_id = %state.run_id(), instance_id = %instance.instance_id))]
    pub async fn evaluate(
        &self,
        state: &RunState,
        instance: &TaskInstance,
        prediction: &Prediction,
        cancel: &CancellationToken,
    ) -> Result<InstanceOutcome, ReportError> {
        let started_at = Utc::now();
        let id = instance.instance_id.as_str();
        self.enter(state, id, EvaluationState::EnvironmentAcquiring).await;

        let spec = EnvironmentSpec {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            base_commit: instance.base_commit.clone(),
        };
        let acquired = self
            .retry
            .execute("acquire", || self.provider.acquire(&spec))
            .await;
        let attempts = acquired.attempts;

        let handle = match acquired.result {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, attempts, "environment acquisition failed");
                let reason = FailureReason::Infra(format!("environment acquisition failed: {err}"));
                let mut collected = Collected::default();
                collected.note(format!("acquisition failed after {attempts} attempt(s): {err}"));
                return self
                    .finish_failed(state, instance, prediction, reason, attempts, started_at, collected)
                    .await;
            }
        };
        info!(environment = %handle.id, attempts, "environment acquired");

        let mut collected = Collected::default();
        collected.note(format!(
            "environment {} acquired after {attempts} attempt(s) at {}",
            handle.id, instance.base_commit
        ));
        let pipeline = AssertUnwindSafe(self.run_pipeline(state, &handle, instance, prediction, cancel, &mut collected))
            .catch_unwind()
            .await;

        let release_error = self.release(handle).await;
        match &release_error {
            Some(err) => collected.note(err),
            None => collected.note("environment released"),
        }

        let failure = match pipeline {
            Ok(Ok(())) => None,
            Ok(Err(Halt::Cancelled)) => Some(FailureReason::Cancelled),
            Ok(Err(Halt::Failed(reason))) => Some(reason),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(panic = %msg, "evaluation pipeline panicked");
                Some(FailureReason::Crashed(msg))
            }
        };

        match failure {
            None => {
                self.finish_classified(state, instance, prediction, attempts, started_at, collected, release_error)
                    .await
            }
            Some(reason) if reason.records_verdict() => {
                self.finish_failed(state, instance, prediction, reason, attempts, started_at, collected)
                    .await
            }
            Some(reason) => {
                info!(reason = %reason, "instance interrupted, no verdict written");
                self.enter(state, id, EvaluationState::Failed(reason.clone())).await;
                state.record_result(id, None).await;
                Ok(InstanceOutcome {
                    instance_id: id.to_string(),
                    verdict: None,
                    failure: Some(reason),
                })
            }
        }
    }

    /// Everything that happens while the environment is held.
    async fn run_pipeline(
        &self,
        state: &RunState,
        handle: &EnvironmentHandle,
        instance: &TaskInstance,
        prediction: &Prediction,
        cancel: &CancellationToken,
        collected: &mut Collected,
    ) -> Result<(), Halt> {
        let id = instance.instance_id.as_str();
        let all_tests = instance.all_tests();

        self.run_setup(handle, instance, collected).await?;
        checkpoint(cancel)?;

        self.enter(state, id, EvaluationState::BaselineTesting).await;
        self.patcher.reset_to_base(handle, &instance.base_commit).await?;
        if let Some(test_patch) = non_empty(instance.test_patch.as_deref()) {
            let applied = self.patcher.apply(handle, test_patch, TEST_PATCH_FILE).await?;
            collected.note(format!("test patch applied={}: {}", applied.applied, applied.detail));
            if !applied.applied {
                return Err(Halt::Failed(FailureReason::Setup(format!(
                    "test patch does not apply to {}: {}",
                    instance.base_commit, applied.detail
                ))));
            }
        }
        let pre = self
            .runner
            .run_tests(handle, instance, &all_tests, TestPhase::PrePatch)
            .await?;
        collected.note_phase(&pre);
        collected.pre = Some(pre);
        checkpoint(cancel)?;

        self.enter(state, id, EvaluationState::Patching).await;
        self.patcher.reset_to_base(handle, &instance.base_commit).await?;
        let apply = self
            .patcher
            .apply(handle, prediction.patch_text(), MODEL_PATCH_FILE)
            .await?;
        let applied = apply.applied;
        if applied {
            info!("patch applied");
            collected.note(format!("patch applied: {}", apply.detail));
        } else {
            warn!(detail = %apply.detail, "patch rejected");
            collected.note(format!("patch rejected: {}", apply.detail));
        }
        collected.apply = Some(apply);

        if applied {
            checkpoint(cancel)?;
            self.enter(state, id, EvaluationState::Testing).await;
            let post = self.run_post_phase(handle, instance, &all_tests).await?;
            collected.note_phase(&post);
            collected.post = Some(post);
        }

        self.enter(state, id, EvaluationState::Classifying).await;
        let pre = collected.pre.clone().unwrap_or_else(|| PhaseResults::new(TestPhase::PrePatch));
        collected.classification = Some(classify(
            &instance.fail_to_pass,
            &instance.pass_to_pass,
            &pre,
            collected.post.as_ref(),
            applied,
        ));
        Ok(())
    }

    async fn run_setup(
        &self,
        handle: &EnvironmentHandle,
        instance: &TaskInstance,
        collected: &mut Collected,
    ) -> Result<(), Halt> {
        for command in &instance.setup_commands {
            let output = self
                .retry
                .execute("setup", || self.provider.exec(handle, command, self.command_timeout))
                .await
                .result?;
            collected.note(format!(
                "setup `{command}` exited with {}\n{}",
                output.exit_code,
                output.combined().trim()
            ));
            if !output.success() {
                return Err(Halt::Failed(FailureReason::Setup(format!(
                    "setup command `{command}` exited with {}: {}",
                    output.exit_code,
                    output.combined().trim()
                ))));
            }
        }
        Ok(())
    }

    async fn run_post_phase(
        &self,
        handle: &EnvironmentHandle,
        instance: &TaskInstance,
        tests: &[String],
    ) -> Result<PhaseResults, Halt> {
        if let Some(test_patch) = non_empty(instance.test_patch.as_deref()) {
            let applied = self.patcher.apply(handle, test_patch, TEST_PATCH_FILE).await?;
            if !applied.applied {
                warn!("test patch conflicts with the candidate patch");
                return Ok(PhaseResults::uniform(
                    TestPhase::PostPatch,
                    tests,
                    TestOutcome::Error,
                    Some(format!("test patch does not apply on top of the candidate patch: {}", applied.detail)),
                ));
            }
        }
        Ok(self
            .runner
            .run_tests(handle, instance, tests, TestPhase::PostPatch)
            .await?)
    }

    async fn release(&self, handle: EnvironmentHandle) -> Option<String> {
        let environment = handle.id;
        match self.provider.release(handle).await {
            Ok(()) => {
                info!(%environment, "environment released");
                None
            }
            Err(err) => {
                error!(%environment, error = %err, "environment release failed");
                Some(format!("environment release failed: {err}"))
            }
        }
    }

    async fn enter(&self, state: &RunState, instance_id: &str, next: EvaluationState) {
        if let Err(err) = state.transition(instance_id, next).await {
            warn!(instance_id, error = %err, "ignoring invalid state transition");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_classified(
        &self,
        state: &RunState,
        instance: &TaskInstance,
        prediction: &Prediction,
        attempts: u32,
        started_at: DateTime<Utc>,
        collected: Collected,
        release_error: Option<String>,
    ) -> Result<InstanceOutcome, ReportError> {
        let id = instance.instance_id.as_str();
        let Some(c) = collected.classification.clone() else {
            let reason = FailureReason::Crashed("pipeline finished without a classification".into());
            return self
                .finish_failed(state, instance, prediction, reason, attempts, started_at, collected)
                .await;
        };

        self.enter(state, id, EvaluationState::Reporting).await;
        let verdict = Verdict {
            schema_version: REPORT_SCHEMA_VERSION,
            instance_id: id.to_string(),
            run_id: state.run_id().to_string(),
            model_name_or_path: prediction.model_name_or_path.clone(),
            kind: c.kind,
            patch_applied: c.patch_applied,
            resolved: c.resolved,
            fail_to_pass_results: c.fail_to_pass_results,
            pass_to_pass_results: c.pass_to_pass_results,
            baseline_broken: c.baseline_broken,
            baseline_failures: c.baseline_failures,
            patch_detail: collected.apply.as_ref().map(|a| a.detail.clone()),
            error: collected
                .post
                .as_ref()
                .and_then(|p| p.error.clone())
                .or_else(|| collected.pre.as_ref().and_then(|p| p.error.clone()))
                .or(release_error),
            provision_attempts: attempts,
            started_at,
            finished_at: Utc::now(),
        };

        if let Err(err) = self.persist(state.run_id(), prediction, &collected, &verdict).await {
            self.enter(state, id, EvaluationState::Failed(FailureReason::Reporting(err.to_string())))
                .await;
            state.record_result(id, None).await;
            return Err(err);
        }

        info!(kind = %verdict.kind, resolved = verdict.resolved, "verdict written");
        self.enter(state, id, EvaluationState::Done).await;
        state.record_result(id, Some(verdict.kind)).await;
        Ok(InstanceOutcome {
            instance_id: id.to_string(),
            verdict: Some(verdict),
            failure: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        state: &RunState,
        instance: &TaskInstance,
        prediction: &Prediction,
        reason: FailureReason,
        attempts: u32,
        started_at: DateTime<Utc>,
        mut collected: Collected,
    ) -> Result<InstanceOutcome, ReportError> {
        let id = instance.instance_id.as_str();
        collected.note(format!("failed: {reason}"));
        let mut verdict = Verdict::infra_error(
            state.run_id(),
            id,
            prediction.model_name_or_path.clone(),
            reason.to_string(),
            started_at,
        );
        verdict.provision_attempts = attempts;
        verdict.patch_detail = collected.apply.as_ref().map(|a| a.detail.clone());

        if let Err(err) = self.persist(state.run_id(), prediction, &collected, &verdict).await {
            self.enter(state, id, EvaluationState::Failed(FailureReason::Reporting(err.to_string())))
                .await;
            state.record_result(id, None).await;
            return Err(err);
        }

        warn!(reason = %reason, "instance failed, infra_error verdict written");
        self.enter(state, id, EvaluationState::Failed(reason.clone())).await;
        state.record_result(id, Some(verdict.kind)).await;
        Ok(InstanceOutcome {
            instance_id: id.to_string(),
            verdict: Some(verdict),
            failure: Some(reason),
        })
    }

    /// Artifacts first, verdict last: the verdict file marks completion.
    async fn persist(
        &self,
        run_id: &str,
        prediction: &Prediction,
        collected: &Collected,
        verdict: &Verdict,
    ) -> Result<(), ReportError> {
        let id = verdict.instance_id.as_str();
        if !prediction.patch_text().is_empty() {
            self.store
                .write_artifact(run_id, id, PATCH_ARTIFACT, prediction.patch_text())
                .await?;
        }
        if !collected.transcript.is_empty() {
            let mut log = collected.transcript.join("\n");
            log.push('\n');
            self.store
                .write_artifact(run_id, id, INSTANCE_LOG_ARTIFACT, &log)
                .await?;
        }
        for phase in [collected.pre.as_ref(), collected.post.as_ref()].into_iter().flatten() {
            if let (Some(which), false) = (phase.phase, phase.raw_output.is_empty()) {
                self.store
                    .write_artifact(run_id, id, which.artifact_name(), &phase.raw_output)
                    .await?;
            }
        }
        self.store.write(run_id, id, verdict).await
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_setup_errors_keep_their_kind() {
        assert!(matches!(
            Halt::from(EnvironmentError::Setup("pip".into())),
            Halt::Failed(FailureReason::Setup(_))
        ));
        assert!(matches!(
            Halt::from(EnvironmentError::Timeout { secs: 3 }),
            Halt::Failed(FailureReason::Infra(_))
        ));
    }

    #[test]
    fn test_checkpoint_observes_cancellation() {
        let token = CancellationToken::new();
        assert!(checkpoint(&token).is_ok());
        token.cancel();
        assert!(matches!(checkpoint(&token), Err(Halt::Cancelled)));
    }
}
