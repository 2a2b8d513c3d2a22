//! Patch application against the checked-out base revision.
//!
//! Patches are applied with `git apply` and exact context only: no fuzz, no
//! three-way merge. Empty and structurally malformed patches are rejected
//! here without touching the environment.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::domain::errors::EnvironmentError;
use crate::domain::ports::{EnvironmentHandle, EnvironmentProvider};
use crate::services::retry::RetryPolicy;
use crate::services::shell;

/// File name of the candidate patch inside the handle's scratch dir.
pub const MODEL_PATCH_FILE: &str = "model.patch";
/// File name of the dataset's test patch inside the handle's scratch dir.
pub const TEST_PATCH_FILE: &str = "test.patch";

/// What a patch looks like before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchShape {
    Empty,
    Malformed(String),
    Unified { files: Vec<String>, hunks: usize },
}

/// Structural check of unified-diff text.
///
/// A patch needs at least one file header and, for each text change, a hunk
/// header. Git-only diffs (renames, mode changes, binary) count as files
/// without hunks.
pub fn inspect_patch(text: &str) -> PatchShape {
    if text.trim().is_empty() {
        return PatchShape::Empty;
    }

    let mut files = Vec::new();
    let mut hunks = 0;
    let mut pending_old = false;
    let mut git_headers = 0;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            git_headers += 1;
            if let Some(path) = rest.split_whitespace().last() {
                files.push(strip_prefix_dir(path).to_string());
            }
        } else if line.starts_with("--- ") {
            pending_old = true;
            continue;
        } else if let (true, Some(path)) = (pending_old, line.strip_prefix("+++ ")) {
            let path = path.split('\t').next().unwrap_or(path).trim();
            let path = strip_prefix_dir(path).to_string();
            if path != "/dev/null" && !files.contains(&path) {
                files.push(path);
            }
        } else if line.starts_with("@@ ") {
            if files.is_empty() {
                return PatchShape::Malformed("hunk before any file header".into());
            }
            hunks += 1;
        }
        pending_old = false;
    }

    if files.is_empty() {
        return PatchShape::Malformed("no file headers found".into());
    }
    if hunks == 0 && git_headers == 0 {
        return PatchShape::Malformed("no hunks found".into());
    }
    PatchShape::Unified { files, hunks }
}

fn strip_prefix_dir(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Result of one apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: bool,
    /// `git apply` output, or the structural reason for rejection.
    pub detail: String,
}

impl ApplyResult {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            applied: false,
            detail: detail.into(),
        }
    }
}

/// Applies patches inside an environment.
///
/// Resetting and writing files are idempotent and go through the retry
/// policy; `git apply` itself runs once, its verdict is final.
pub struct PatchApplicator {
    provider: Arc<dyn EnvironmentProvider>,
    retry: RetryPolicy,
    command_timeout: Duration,
}

impl PatchApplicator {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, retry: RetryPolicy, command_timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            command_timeout,
        }
    }

    /// Discard tracked and untracked changes, returning to `base_commit`.
    #[instrument(skip(self, handle), fields(instance_id = %handle.instance_id))]
    pub async fn reset_to_base(&self, handle: &EnvironmentHandle, base_commit: &str) -> Result<(), EnvironmentError> {
        let command = format!(
            "git reset --hard -q {} && git clean -fdq",
            shell::quote(base_commit)
        );
        let output = self
            .retry
            .execute("reset", || self.provider.exec(handle, &command, self.command_timeout))
            .await
            .result?;
        if !output.success() {
            return Err(EnvironmentError::Setup(format!(
                "could not reset checkout to {base_commit}: {}",
                output.combined().trim()
            )));
        }
        Ok(())
    }

    /// Apply `patch_text`, stored in the scratch dir as `file_name`.
    ///
    /// `Ok` carries the apply verdict, including structural rejections.
    /// `Err` means the environment itself failed.
    #[instrument(skip(self, handle, patch_text), fields(instance_id = %handle.instance_id))]
    pub async fn apply(
        &self,
        handle: &EnvironmentHandle,
        patch_text: &str,
        file_name: &str,
    ) -> Result<ApplyResult, EnvironmentError> {
        match inspect_patch(patch_text) {
            PatchShape::Empty => return Ok(ApplyResult::rejected("patch is empty")),
            PatchShape::Malformed(reason) => {
                return Ok(ApplyResult::rejected(format!("malformed patch: {reason}")))
            }
            PatchShape::Unified { files, hunks } => {
                debug!(files = files.len(), hunks, "patch structure ok");
            }
        }

        let path = format!("{}/{}", handle.scratch_dir.trim_end_matches('/'), file_name);
        let write = shell::write_file_command(&path, patch_text);
        let written = self
            .retry
            .execute("write_patch", || self.provider.exec(handle, &write, self.command_timeout))
            .await
            .result?;
        if !written.success() {
            return Err(EnvironmentError::Exec(format!(
                "could not write {file_name}: {}",
                written.combined().trim()
            )));
        }

        let output = self
            .provider
            .exec(
                handle,
                &format!("git apply --verbose {}", shell::quote(&path)),
                self.command_timeout,
            )
            .await?;
        let detail = output.combined().trim().to_string();
        info!(file = file_name, applied = output.success(), "git apply finished");
        Ok(ApplyResult {
            applied: output.success(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "diff --git a/src/lib.py b/src/lib.py\n\
--- a/src/lib.py\n\
+++ b/src/lib.py\n\
@@ -1,2 +1,2 @@\n\
-x = 1\n\
+x = 2\n";

    #[test]
    fn test_empty_patch() {
        assert_eq!(inspect_patch(""), PatchShape::Empty);
        assert_eq!(inspect_patch("  \n\t\n"), PatchShape::Empty);
    }

    #[test]
    fn test_valid_patch_lists_files() {
        assert_eq!(
            inspect_patch(VALID),
            PatchShape::Unified {
                files: vec!["src/lib.py".into()],
                hunks: 1
            }
        );
    }

    #[test]
    fn test_plain_unified_diff_without_git_header() {
        let patch = "--- a/x.py\t2024-01-01\n+++ b/x.py\t2024-01-01\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(inspect_patch(patch), PatchShape::Unified { hunks: 1, .. }));
    }

    #[test]
    fn test_rename_only_git_diff_is_accepted() {
        let patch = "diff --git a/old.py b/new.py\nsimilarity index 100%\nrename from old.py\nrename to new.py\n";
        assert_eq!(
            inspect_patch(patch),
            PatchShape::Unified {
                files: vec!["new.py".into()],
                hunks: 0
            }
        );
    }

    #[test]
    fn test_malformed_patches() {
        assert!(matches!(
            inspect_patch("I fixed the bug by editing foo.py"),
            PatchShape::Malformed(_)
        ));
        assert!(matches!(inspect_patch("@@ -1 +1 @@\n-a\n+b\n"), PatchShape::Malformed(_)));
        assert!(matches!(inspect_patch("+++ b/x.py\n@@ -1 +1 @@\n"), PatchShape::Malformed(_)));
        assert!(matches!(
            inspect_patch("--- a/x.py\n+++ b/x.py\n-a\n+b\n"),
            PatchShape::Malformed(_)
        ));
    }

    #[test]
    fn test_new_file_patch() {
        let patch = "--- /dev/null\n+++ b/new.py\n@@ -0,0 +1 @@\n+print(1)\n";
        assert_eq!(
            inspect_patch(patch),
            PatchShape::Unified {
                files: vec!["new.py".into()],
                hunks: 1
            }
        );
    }
}
