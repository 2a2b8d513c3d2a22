//! Run-level summary, always derived from the per-instance verdicts.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::domain::errors::ReportError;
use crate::domain::models::{RunManifest, Verdict, VerdictKind};
use crate::domain::ports::ReportStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Number of instances the latest invocation selected, if known.
    pub selected: Option<usize>,
    pub reported: usize,
    pub counts: BTreeMap<VerdictKind, usize>,
    pub patch_applied: usize,
    /// Selected instances that have no verdict yet.
    pub missing: Vec<String>,
    pub complete: bool,
}

impl RunSummary {
    pub fn from_verdicts(run_id: &str, verdicts: &[Verdict], manifest: Option<&RunManifest>) -> Self {
        let mut counts: BTreeMap<VerdictKind, usize> =
            VerdictKind::ALL.iter().map(|k| (*k, 0)).collect();
        for verdict in verdicts {
            *counts.entry(verdict.kind).or_default() += 1;
        }

        let reported_ids: HashSet<&str> = verdicts.iter().map(|v| v.instance_id.as_str()).collect();
        let missing: Vec<String> = manifest
            .map(|m| {
                m.selected
                    .iter()
                    .filter(|id| !reported_ids.contains(id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            run_id: run_id.to_string(),
            selected: manifest.map(|m| m.selected.len()),
            reported: verdicts.len(),
            patch_applied: verdicts.iter().filter(|v| v.patch_applied).count(),
            complete: manifest.is_some() && missing.is_empty(),
            counts,
            missing,
        }
    }

    pub fn count(&self, kind: VerdictKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Resolved share of reported instances, 0.0 when nothing is reported.
    pub fn resolved_rate(&self) -> f64 {
        if self.reported == 0 {
            return 0.0;
        }
        self.count(VerdictKind::Resolved) as f64 / self.reported as f64
    }
}

/// Read every verdict of `run_id` and summarize them.
pub async fn summarize(store: &dyn ReportStore, run_id: &str) -> Result<(RunSummary, Vec<Verdict>), ReportError> {
    let manifest = store.read_manifest(run_id).await?;
    let mut verdicts = store.read_all(run_id).await?;
    verdicts.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    Ok((
        RunSummary::from_verdicts(run_id, &verdicts, manifest.as_ref()),
        verdicts,
    ))
}
