//! Filesystem report store.
//!
//! ```text
//! <root>/<run_id>/run.json
//! <root>/<run_id>/instances/<instance_id>.json
//! <root>/<run_id>/logs/<instance_id>/<artifact>
//! ```
//! Every file is written to a temp file in its destination directory,
//! fsynced and renamed into place, so readers never see partial content.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::ReportError;
use crate::domain::models::{RunManifest, Verdict, REPORT_SCHEMA_VERSION};
use crate::domain::ports::{is_valid_key, ReportStore};

const MANIFEST_FILE: &str = "run.json";
const INSTANCES_DIR: &str = "instances";
const LOGS_DIR: &str = "logs";

fn io_error(path: &Path, source: std::io::Error) -> ReportError {
    ReportError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn check_key(key: &str) -> Result<&str, ReportError> {
    if is_valid_key(key) {
        Ok(key)
    } else {
        Err(ReportError::InvalidKey(key.to_string()))
    }
}

/// Write `contents` to `path` atomically.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ReportError> {
    let dir = path
        .parent()
        .ok_or_else(|| ReportError::InvalidKey(path.display().to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    tmp.write_all(contents).map_err(|e| io_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;

    // Make the rename itself durable.
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ReportError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ReportError::Corrupt {
            path: path.display().to_string(),
            source,
        })
}

/// Move a run directory out of the way, then delete it.
///
/// The rename is atomic, so readers see either the old run or no run at all.
/// The discarded copy is dot-prefixed and can never be named as a run id.
fn discard_run_dir(run_dir: &Path) -> Result<(), ReportError> {
    let name = run_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReportError::InvalidKey(run_dir.display().to_string()))?;
    let discarded = run_dir.with_file_name(format!(".{name}.discarded-{}", Uuid::new_v4().simple()));
    std::fs::rename(run_dir, &discarded).map_err(|e| io_error(run_dir, e))?;
    if let Err(e) = std::fs::remove_dir_all(&discarded) {
        warn!(path = %discarded.display(), error = %e, "failed to delete discarded run directory");
    }
    Ok(())
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(path: &Path, f: F) -> Result<T, ReportError>
where
    F: FnOnce() -> Result<T, ReportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io_error(path, std::io::Error::other(e.to_string())))?
}

/// [`ReportStore`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    root: PathBuf,
}

impl FsReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf, ReportError> {
        Ok(self.root.join(check_key(run_id)?))
    }

    pub fn verdict_path(&self, run_id: &str, instance_id: &str) -> Result<PathBuf, ReportError> {
        Ok(self
            .run_dir(run_id)?
            .join(INSTANCES_DIR)
            .join(format!("{}.json", check_key(instance_id)?)))
    }

    pub fn artifact_path(&self, run_id: &str, instance_id: &str, name: &str) -> Result<PathBuf, ReportError> {
        Ok(self
            .run_dir(run_id)?
            .join(LOGS_DIR)
            .join(check_key(instance_id)?)
            .join(check_key(name)?))
    }

    fn manifest_path(&self, run_id: &str) -> Result<PathBuf, ReportError> {
        Ok(self.run_dir(run_id)?.join(MANIFEST_FILE))
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn prepare_run(&self, manifest: &RunManifest, rewrite: bool) -> Result<(), ReportError> {
        let path = self.manifest_path(&manifest.run_id)?;
        let mut next = manifest.clone();

        let existing: Option<RunManifest> = {
            let path = path.clone();
            blocking(&path.clone(), move || read_json(&path)).await?
        };
        if let Some(existing) = existing {
            if !rewrite {
                if existing.schema_version != REPORT_SCHEMA_VERSION {
                    return Err(ReportError::SchemaMismatch {
                        run_id: manifest.run_id.clone(),
                        found: existing.schema_version,
                        expected: REPORT_SCHEMA_VERSION,
                    });
                }
                if existing.source_label() != manifest.source_label() {
                    return Err(ReportError::IncompatibleRun {
                        run_id: manifest.run_id.clone(),
                        existing: existing.source_label(),
                        requested: manifest.source_label(),
                    });
                }
                next.created_at = existing.created_at;
                info!(run_id = %manifest.run_id, "resuming existing run");
            } else if existing.schema_version != REPORT_SCHEMA_VERSION
                || existing.source_label() != manifest.source_label()
            {
                // Verdicts from another dataset or schema must not merge into this run.
                info!(
                    run_id = %manifest.run_id,
                    previous = %existing.source_label(),
                    "discarding reports of an incompatible run"
                );
                let run_dir = self.run_dir(&manifest.run_id)?;
                blocking(&run_dir.clone(), move || discard_run_dir(&run_dir)).await?;
            } else {
                next.created_at = existing.created_at;
                info!(run_id = %manifest.run_id, "rewriting reports of existing run");
            }
        }
        next.updated_at = Utc::now();

        let bytes = serde_json::to_vec_pretty(&next)?;
        blocking(&path.clone(), move || write_atomic(&path, &bytes)).await
    }

    async fn has_report(&self, run_id: &str, instance_id: &str) -> Result<bool, ReportError> {
        let path = self.verdict_path(run_id, instance_id)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn read(&self, run_id: &str, instance_id: &str) -> Result<Option<Verdict>, ReportError> {
        let path = self.verdict_path(run_id, instance_id)?;
        blocking(&path.clone(), move || read_json(&path)).await
    }

    async fn write(&self, run_id: &str, instance_id: &str, verdict: &Verdict) -> Result<(), ReportError> {
        let path = self.verdict_path(run_id, instance_id)?;
        let bytes = serde_json::to_vec_pretty(verdict)?;
        debug!(path = %path.display(), "writing verdict");
        blocking(&path.clone(), move || write_atomic(&path, &bytes)).await
    }

    async fn write_artifact(
        &self,
        run_id: &str,
        instance_id: &str,
        name: &str,
        contents: &str,
    ) -> Result<(), ReportError> {
        let path = self.artifact_path(run_id, instance_id, name)?;
        let bytes = contents.as_bytes().to_vec();
        blocking(&path.clone(), move || write_atomic(&path, &bytes)).await
    }

    async fn read_all(&self, run_id: &str) -> Result<Vec<Verdict>, ReportError> {
        let dir = self.run_dir(run_id)?.join(INSTANCES_DIR);
        blocking(&dir.clone(), move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(io_error(&dir, e)),
            };

            let mut verdicts = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| io_error(&dir, e))?.path();
                let is_verdict = path.extension().is_some_and(|ext| ext == "json")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| !n.starts_with('.'));
                if !is_verdict {
                    continue;
                }
                if let Some(verdict) = read_json::<Verdict>(&path)? {
                    verdicts.push(verdict);
                }
            }
            Ok(verdicts)
        })
        .await
    }

    async fn read_manifest(&self, run_id: &str) -> Result<Option<RunManifest>, ReportError> {
        let path = self.manifest_path(run_id)?;
        blocking(&path.clone(), move || read_json(&path)).await
    }
}
