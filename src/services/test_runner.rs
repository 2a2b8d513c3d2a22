//! Test runner: executes an instance's test command and maps its output to
//! per-test outcomes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::domain::errors::EnvironmentError;
use crate::domain::models::{PhaseResults, TaskInstance, TestOutcome, TestPhase, TESTS_PLACEHOLDER};
use crate::domain::ports::{EnvironmentHandle, EnvironmentProvider};
use crate::services::log_parser::{self, END_MARKER, START_MARKER};
use crate::services::retry::RetryPolicy;
use crate::services::shell;

/// Extra time granted to the provider to honor its own timeout before the
/// runner gives up on the call.
const EXEC_GRACE: Duration = Duration::from_secs(15);

/// Render the instance's command template for `test_ids`.
///
/// Ids are shell-quoted and substituted for `{tests}`; a template without
/// the placeholder runs as written.
pub fn build_command(template: &str, test_ids: &[String]) -> String {
    if !template.contains(TESTS_PLACEHOLDER) {
        return template.to_string();
    }
    let tests = test_ids
        .iter()
        .map(|id| shell::quote(id))
        .collect::<Vec<_>>()
        .join(" ");
    template.replace(TESTS_PLACEHOLDER, &tests)
}

/// The test command wrapped in output markers, stderr folded into stdout so
/// both reach the parser in order. Exits with the test command's status.
pub fn framed_command(command: &str) -> String {
    format!(
        "echo '{START_MARKER}'\n( {command} ) 2>&1\nrc=$?\necho '{END_MARKER}'\nexit $rc\n"
    )
}

/// Runs test phases inside an environment.
pub struct TestRunner {
    provider: Arc<dyn EnvironmentProvider>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl TestRunner {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            default_timeout,
        }
    }

    /// Phase timeout for `instance`: its own `timeout_secs`, else the default.
    pub fn timeout_for(&self, instance: &TaskInstance) -> Duration {
        instance
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs)
    }

    /// Run `test_ids` for one phase.
    ///
    /// A timeout or a failed exec marks every requested test `error`; ids
    /// missing from the output are `not_run`. Only transient provider
    /// errors that outlast the retry policy come back as `Err`.
    #[instrument(
        skip(self, handle, instance, test_ids),
        fields(instance_id = %instance.instance_id, phase = %phase, tests = test_ids.len())
    )]
    pub async fn run_tests(
        &self,
        handle: &EnvironmentHandle,
        instance: &TaskInstance,
        test_ids: &[String],
        phase: TestPhase,
    ) -> Result<PhaseResults, EnvironmentError> {
        let timeout = self.timeout_for(instance);
        let command = framed_command(&build_command(&instance.test_command_template, test_ids));

        let provider = &self.provider;
        let command = command.as_str();
        let attempted = self
            .retry
            .execute("run_tests", || async move {
                tokio::time::timeout(timeout + EXEC_GRACE, provider.exec(handle, command, timeout))
                    .await
                    .unwrap_or(Err(EnvironmentError::Timeout {
                        secs: timeout.as_secs(),
                    }))
            })
            .await;

        let output = match attempted.result {
            Ok(output) => output,
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                warn!(error = %err, "test phase aborted, marking all tests as error");
                return Ok(PhaseResults::uniform(
                    phase,
                    test_ids,
                    TestOutcome::Error,
                    Some(err.to_string()),
                ));
            }
        };

        let raw = output.combined();
        let parsed = log_parser::parse_log(instance.log_parser, &raw);
        let mut results = PhaseResults::new(phase);
        for id in test_ids {
            let outcome = parsed.get(id).copied().unwrap_or(TestOutcome::NotRun);
            results.outcomes.insert(id.clone(), outcome);
        }

        let passed = results.outcomes.values().filter(|o| o.is_pass()).count();
        let not_run = results
            .outcomes
            .values()
            .filter(|o| **o == TestOutcome::NotRun)
            .count();
        if parsed.is_empty() && !output.success() {
            warn!(exit_code = output.exit_code, "test command produced no parsable results");
        }
        info!(
            exit_code = output.exit_code,
            passed,
            not_run,
            total = test_ids.len(),
            "test phase finished"
        );

        results.raw_output = raw;
        Ok(results)
    }
}
