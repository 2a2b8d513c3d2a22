//! Local git-checkout environment provider.
//!
//! Each repository is mirrored once into the cache directory. Every
//! acquisition gets its own `git clone --shared` checkout detached at the
//! base commit, plus a private scratch directory; release deletes both.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::EnvironmentError;
use crate::domain::models::EnvironmentConfig;
use crate::domain::ports::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, ExecOutput};

/// Run `sh -c command` in `cwd` inside its own process group.
///
/// On timeout the whole group is killed so test runners cannot leave
/// orphaned children behind.
pub async fn run_shell(cwd: &Path, command: &str, timeout: Duration) -> Result<ExecOutput, EnvironmentError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    spawn_and_wait(cmd, timeout).await
}

async fn spawn_and_wait(mut cmd: Command, timeout: Duration) -> Result<ExecOutput, EnvironmentError> {
    let child = cmd
        .spawn()
        .map_err(|e| EnvironmentError::Exec(format!("failed to spawn process: {e}")))?;
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }),
        Ok(Err(e)) => Err(EnvironmentError::Exec(format!("failed to wait for process: {e}"))),
        Err(_) => {
            if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
                if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                    debug!(pid, error = %e, "process group already gone");
                }
            }
            Err(EnvironmentError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    }
}

/// Directory-safe form of a repository name (`owner/name` → `owner__name`).
fn mirror_name(repo: &str) -> String {
    let safe: String = repo
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    format!("{}.git", safe.replace('_', "__").trim_start_matches('.'))
}

/// Environment provider backed by local git checkouts.
pub struct LocalGitProvider {
    workspace_root: PathBuf,
    cache_dir: PathBuf,
    repo_url_template: String,
    keep_workspaces: bool,
    git_timeout: Duration,
    mirror_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    live: RwLock<HashMap<Uuid, PathBuf>>,
}

impl LocalGitProvider {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            workspace_root: PathBuf::from(&config.workspace_root),
            cache_dir: PathBuf::from(&config.cache_dir),
            repo_url_template: config.repo_url_template.clone(),
            keep_workspaces: config.keep_workspaces,
            git_timeout: Duration::from_secs(config.git_timeout_secs),
            mirror_locks: Mutex::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Where `repo` is cloned from: a local directory as-is, otherwise the
    /// URL template with `{repo}` substituted.
    pub fn repo_url(&self, repo: &str) -> String {
        if Path::new(repo).is_dir() {
            return repo.to_string();
        }
        self.repo_url_template.replace("{repo}", repo)
    }

    pub fn mirror_path(&self, repo: &str) -> PathBuf {
        self.cache_dir.join(mirror_name(repo))
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    async fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<ExecOutput, EnvironmentError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        spawn_and_wait(cmd, self.git_timeout).await
    }

    async fn has_commit(&self, mirror: &Path, commit: &str) -> Result<bool, EnvironmentError> {
        let object = format!("{commit}^{{commit}}");
        let out = self.git(Some(mirror), &["cat-file", "-e", &object]).await?;
        Ok(out.success())
    }

    /// Make sure a mirror of `repo` containing `commit` exists.
    async fn ensure_mirror(&self, repo: &str, commit: &str) -> Result<PathBuf, EnvironmentError> {
        let lock = {
            let mut locks = self.mirror_locks.lock().await;
            Arc::clone(locks.entry(repo.to_string()).or_default())
        };
        let _guard = lock.lock().await;

        let mirror = self.mirror_path(repo);
        if !mirror.exists() {
            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| EnvironmentError::Setup(format!("cannot create cache dir: {e}")))?;
            let url = self.repo_url(repo);
            info!(repo, url = %url, "creating repository mirror");
            let mirror_str = mirror.to_string_lossy().into_owned();
            let out = self
                .git(None, &["clone", "--mirror", "--quiet", &url, &mirror_str])
                .await?;
            if !out.success() {
                let _ = tokio::fs::remove_dir_all(&mirror).await;
                return Err(EnvironmentError::Network(format!(
                    "git clone --mirror {url} failed: {}",
                    out.stderr.trim()
                )));
            }
        }

        if !self.has_commit(&mirror, commit).await? {
            debug!(repo, commit, "commit missing from mirror, fetching");
            let out = self.git(Some(&mirror), &["fetch", "--quiet", "--prune", "origin"]).await?;
            if !out.success() {
                return Err(EnvironmentError::Network(format!(
                    "git fetch for {repo} failed: {}",
                    out.stderr.trim()
                )));
            }
            if !self.has_commit(&mirror, commit).await? {
                return Err(EnvironmentError::Setup(format!(
                    "commit {commit} not found in {repo}"
                )));
            }
        }
        Ok(mirror)
    }

    async fn remove_workspace(&self, dir: &Path) {
        if self.keep_workspaces {
            debug!(dir = %dir.display(), "keeping workspace");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove workspace");
        }
    }
}

#[async_trait]
impl EnvironmentProvider for LocalGitProvider {
    fn name(&self) -> &'static str {
        "local-git"
    }

    async fn acquire(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, EnvironmentError> {
        let mirror = self.ensure_mirror(&spec.repo, &spec.base_commit).await?;

        let id = Uuid::new_v4();
        let dir = self
            .workspace_root
            .join(format!("{}-{}", spec.instance_id, id.simple()));
        tokio::fs::create_dir_all(dir.join("scratch"))
            .await
            .map_err(|e| EnvironmentError::Setup(format!("cannot create workspace: {e}")))?;
        // Commands run inside the checkout, so every path handed out is absolute.
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .map_err(|e| EnvironmentError::Setup(format!("cannot resolve workspace: {e}")))?;
        let workdir = dir.join("repo");
        let scratch = dir.join("scratch");

        let mirror_str = mirror.to_string_lossy().into_owned();
        let workdir_str = workdir.to_string_lossy().into_owned();
        let cloned = self
            .git(None, &["clone", "--shared", "--no-checkout", "--quiet", &mirror_str, &workdir_str])
            .await;
        let checkout = match cloned {
            Ok(out) if out.success() => {
                self.git(Some(&workdir), &["checkout", "--detach", "--quiet", &spec.base_commit])
                    .await
            }
            Ok(out) => Err(EnvironmentError::Setup(format!(
                "local clone failed: {}",
                out.stderr.trim()
            ))),
            Err(e) => Err(e),
        };
        match checkout {
            Ok(out) if out.success() => {}
            Ok(out) => {
                self.remove_workspace(&dir).await;
                return Err(EnvironmentError::Setup(format!(
                    "checkout of {} failed: {}",
                    spec.base_commit,
                    out.stderr.trim()
                )));
            }
            Err(e) => {
                self.remove_workspace(&dir).await;
                return Err(e);
            }
        }

        self.live.write().await.insert(id, dir.clone());
        info!(instance_id = %spec.instance_id, environment = %id, dir = %dir.display(), "workspace ready");
        Ok(EnvironmentHandle {
            id,
            instance_id: spec.instance_id.clone(),
            workdir: workdir_str,
            scratch_dir: scratch.to_string_lossy().into_owned(),
        })
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, EnvironmentError> {
        if !self.live.read().await.contains_key(&handle.id) {
            return Err(EnvironmentError::UnknownHandle(handle.id.to_string()));
        }
        run_shell(Path::new(&handle.workdir), command, timeout).await
    }

    async fn release(&self, handle: EnvironmentHandle) -> Result<(), EnvironmentError> {
        let dir = self
            .live
            .write()
            .await
            .remove(&handle.id)
            .ok_or_else(|| EnvironmentError::UnknownHandle(handle.id.to_string()))?;
        self.remove_workspace(&dir).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(root: &Path) -> LocalGitProvider {
        LocalGitProvider::new(&EnvironmentConfig {
            workspace_root: root.join("ws").to_string_lossy().into_owned(),
            cache_dir: root.join("cache").to_string_lossy().into_owned(),
            ..EnvironmentConfig::default()
        })
    }

    #[test]
    fn test_mirror_name_is_path_safe() {
        assert_eq!(mirror_name("django/django"), "django__django.git");
        assert_eq!(mirror_name("a_b/c"), "a__b__c.git");
        assert!(!mirror_name("../evil").contains('/'));
    }

    #[test]
    fn test_repo_url_template() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        assert_eq!(p.repo_url("psf/requests"), "https://github.com/psf/requests.git");
        let local = dir.path().to_string_lossy().into_owned();
        assert_eq!(p.repo_url(&local), local);
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell(dir.path(), "echo out; echo err >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_shell_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let err = run_shell(dir.path(), "sleep 30", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unknown_handle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let handle = EnvironmentHandle::new("x", "/nonexistent", "/nonexistent");
        let err = p.exec(&handle, "true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EnvironmentError::UnknownHandle(_)));
        assert!(matches!(
            p.release(handle).await,
            Err(EnvironmentError::UnknownHandle(_))
        ));
    }
}
