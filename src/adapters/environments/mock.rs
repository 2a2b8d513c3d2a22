//! Scripted in-process environment provider for tests.
//!
//! Commands are recognized by shape: heredoc file writes, `git reset`,
//! `git apply`, framed test runs and anything else (setup commands).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::EnvironmentError;
use crate::domain::ports::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, ExecOutput};
use crate::services::log_parser::{END_MARKER, START_MARKER};
use crate::services::patch_applicator::{MODEL_PATCH_FILE, TEST_PATCH_FILE};

/// Behavior of the mock for one instance.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Transient acquire failures before acquisition succeeds.
    pub acquire_failures: u32,
    /// Permanent acquire failure, returned every time.
    pub acquire_error: Option<EnvironmentError>,
    pub setup_exit_code: i32,
    pub model_patch_applies: bool,
    pub test_patch_applies: bool,
    /// Test output before the model patch is applied.
    pub pre_output: String,
    /// Test output once the model patch is applied.
    pub post_output: String,
    pub pre_timeout: bool,
    pub post_timeout: bool,
    /// Delay added to every test run.
    pub test_delay: Duration,
    /// Panic inside the post-patch test run.
    pub panic_in_tests: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            acquire_failures: 0,
            acquire_error: None,
            setup_exit_code: 0,
            model_patch_applies: true,
            test_patch_applies: true,
            pre_output: String::new(),
            post_output: String::new(),
            pre_timeout: false,
            post_timeout: false,
            test_delay: Duration::ZERO,
            panic_in_tests: false,
        }
    }
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_output(mut self, output: impl Into<String>) -> Self {
        self.pre_output = output.into();
        self
    }

    pub fn with_post_output(mut self, output: impl Into<String>) -> Self {
        self.post_output = output.into();
        self
    }

    pub fn rejecting_patch(mut self) -> Self {
        self.model_patch_applies = false;
        self
    }

    pub fn rejecting_test_patch(mut self) -> Self {
        self.test_patch_applies = false;
        self
    }

    pub fn failing_acquire(mut self, transient_failures: u32) -> Self {
        self.acquire_failures = transient_failures;
        self
    }

    pub fn with_acquire_error(mut self, error: EnvironmentError) -> Self {
        self.acquire_error = Some(error);
        self
    }

    pub fn failing_setup(mut self, exit_code: i32) -> Self {
        self.setup_exit_code = exit_code;
        self
    }

    pub fn timing_out_pre(mut self) -> Self {
        self.pre_timeout = true;
        self
    }

    pub fn timing_out_post(mut self) -> Self {
        self.post_timeout = true;
        self
    }

    pub fn with_test_delay(mut self, delay: Duration) -> Self {
        self.test_delay = delay;
        self
    }

    pub fn panicking_in_tests(mut self) -> Self {
        self.panic_in_tests = true;
        self
    }
}

/// Counters observed by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub acquire_calls: usize,
    pub acquisitions: usize,
    pub releases: usize,
    pub active: usize,
    pub peak_active: usize,
    pub exec_calls: usize,
}

#[derive(Debug)]
struct LiveEnv {
    instance_id: String,
    patched: bool,
}

/// In-process [`EnvironmentProvider`] driven by [`MockScript`]s.
pub struct MockEnvironmentProvider {
    default_script: MockScript,
    scripts: RwLock<HashMap<String, MockScript>>,
    acquire_attempts: RwLock<HashMap<String, u32>>,
    live: RwLock<HashMap<Uuid, LiveEnv>>,
    commands: RwLock<Vec<(String, String)>>,
    acquire_calls: AtomicUsize,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    exec_calls: AtomicUsize,
}

impl MockEnvironmentProvider {
    pub fn new() -> Self {
        Self::with_default_script(MockScript::default())
    }

    pub fn with_default_script(script: MockScript) -> Self {
        Self {
            default_script: script,
            scripts: RwLock::new(HashMap::new()),
            acquire_attempts: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            commands: RwLock::new(Vec::new()),
            acquire_calls: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            exec_calls: AtomicUsize::new(0),
        }
    }

    /// Set the script for one instance id.
    pub async fn set_script(&self, instance_id: impl Into<String>, script: MockScript) {
        self.scripts.write().await.insert(instance_id.into(), script);
    }

    async fn script_for(&self, instance_id: &str) -> MockScript {
        self.scripts
            .read()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    pub fn stats(&self) -> MockStats {
        MockStats {
            acquire_calls: self.acquire_calls.load(Ordering::SeqCst),
            acquisitions: self.acquisitions.load(Ordering::SeqCst),
            releases: self.releases.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            exec_calls: self.exec_calls.load(Ordering::SeqCst),
        }
    }

    /// Commands executed for `instance_id`, in order.
    pub async fn commands_for(&self, instance_id: &str) -> Vec<String> {
        self.commands
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    async fn run_tests(
        &self,
        script: &MockScript,
        patched: bool,
        timeout: Duration,
    ) -> Result<ExecOutput, EnvironmentError> {
        if !script.test_delay.is_zero() {
            tokio::time::sleep(script.test_delay).await;
        }
        if patched && script.panic_in_tests {
            panic!("mock test runner crashed");
        }
        let (timed_out, body) = if patched {
            (script.post_timeout, &script.post_output)
        } else {
            (script.pre_timeout, &script.pre_output)
        };
        if timed_out {
            return Err(EnvironmentError::Timeout {
                secs: timeout.as_secs(),
            });
        }
        Ok(ExecOutput {
            stdout: format!("{START_MARKER}\n{body}\n{END_MARKER}\n"),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

impl Default for MockEnvironmentProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn exit_with(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

#[async_trait]
impl EnvironmentProvider for MockEnvironmentProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn acquire(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, EnvironmentError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(&spec.instance_id).await;
        if let Some(err) = script.acquire_error {
            return Err(err);
        }

        let attempt = {
            let mut attempts = self.acquire_attempts.write().await;
            let n = attempts.entry(spec.instance_id.clone()).or_default();
            *n += 1;
            *n
        };
        if attempt <= script.acquire_failures {
            return Err(EnvironmentError::Unavailable(format!(
                "mock capacity exhausted (attempt {attempt})"
            )));
        }

        let handle = EnvironmentHandle::new(
            &spec.instance_id,
            format!("/mock/{}/repo", spec.instance_id),
            format!("/mock/{}/scratch", spec.instance_id),
        );
        self.live.write().await.insert(
            handle.id,
            LiveEnv {
                instance_id: spec.instance_id.clone(),
                patched: false,
            },
        );
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, EnvironmentError> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        let (instance_id, patched) = {
            let live = self.live.read().await;
            let env = live
                .get(&handle.id)
                .ok_or_else(|| EnvironmentError::UnknownHandle(handle.id.to_string()))?;
            (env.instance_id.clone(), env.patched)
        };
        self.commands
            .write()
            .await
            .push((instance_id.clone(), command.to_string()));
        let script = self.script_for(&instance_id).await;

        if command.starts_with("cat > ") {
            return Ok(exit_with(0, ""));
        }
        if command.starts_with("git reset --hard") {
            if let Some(env) = self.live.write().await.get_mut(&handle.id) {
                env.patched = false;
            }
            return Ok(exit_with(0, ""));
        }
        if command.starts_with("git apply") {
            if command.contains(MODEL_PATCH_FILE) {
                if !script.model_patch_applies {
                    return Ok(exit_with(1, "error: patch failed: src/app.py:10\nerror: src/app.py: patch does not apply"));
                }
                if let Some(env) = self.live.write().await.get_mut(&handle.id) {
                    env.patched = true;
                }
                return Ok(exit_with(0, "Applied patch src/app.py cleanly."));
            }
            if command.contains(TEST_PATCH_FILE) && !script.test_patch_applies {
                return Ok(exit_with(1, "error: tests/test_app.py: patch does not apply"));
            }
            return Ok(exit_with(0, "Applied patch tests/test_app.py cleanly."));
        }
        if command.contains(START_MARKER) {
            return self.run_tests(&script, patched, timeout).await;
        }
        Ok(exit_with(script.setup_exit_code, ""))
    }

    async fn release(&self, handle: EnvironmentHandle) -> Result<(), EnvironmentError> {
        if self.live.write().await.remove(&handle.id).is_none() {
            return Err(EnvironmentError::UnknownHandle(handle.id.to_string()));
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            instance_id: id.to_string(),
            repo: "o/r".to_string(),
            base_commit: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_acquire_release_counters() {
        let mock = MockEnvironmentProvider::new();
        let a = mock.acquire(&spec("a")).await.unwrap();
        let b = mock.acquire(&spec("b")).await.unwrap();
        assert_eq!(mock.stats().active, 2);

        mock.release(a).await.unwrap();
        mock.release(b).await.unwrap();
        let stats = mock.stats();
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.peak_active, 2);
    }

    #[tokio::test]
    async fn test_transient_acquire_failures() {
        let mock = MockEnvironmentProvider::new();
        mock.set_script("a", MockScript::new().failing_acquire(2)).await;

        assert!(mock.acquire(&spec("a")).await.unwrap_err().is_transient());
        assert!(mock.acquire(&spec("a")).await.is_err());
        assert!(mock.acquire(&spec("a")).await.is_ok());
        assert_eq!(mock.stats().acquire_calls, 3);
    }

    #[tokio::test]
    async fn test_outputs_follow_patch_state() {
        let mock = MockEnvironmentProvider::with_default_script(
            MockScript::new()
                .with_pre_output("FAILED t::a")
                .with_post_output("PASSED t::a"),
        );
        let h = mock.acquire(&spec("a")).await.unwrap();
        let t = Duration::from_secs(1);
        let run = format!("echo '{START_MARKER}'\npytest");

        let pre = mock.exec(&h, &run, t).await.unwrap();
        assert!(pre.stdout.contains("FAILED t::a"));

        mock.exec(&h, "git apply --verbose /mock/a/scratch/model.patch", t).await.unwrap();
        let post = mock.exec(&h, &run, t).await.unwrap();
        assert!(post.stdout.contains("PASSED t::a"));

        mock.exec(&h, "git reset --hard -q abc && git clean -fdq", t).await.unwrap();
        let again = mock.exec(&h, &run, t).await.unwrap();
        assert!(again.stdout.contains("FAILED t::a"));
    }
}
