//! `patchgrade report`: summarize the verdicts of a run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::adapters::reports::FsReportStore;
use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::{Config, Verdict};
use crate::domain::ports::ReportStore;
use crate::services::{summarize, RunSummary};

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    /// Run identifier
    #[arg(short, long)]
    pub run_id: String,

    /// Report directory [default: from config]
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// List every instance verdict, not just the totals
    #[arg(long)]
    pub instances: bool,
}

#[derive(Debug, Serialize)]
pub struct ReportOutput {
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdicts: Option<Vec<Verdict>>,
}

impl CommandOutput for ReportOutput {
    fn to_human(&self) -> String {
        let formatter = TableFormatter::new();
        let mut lines = vec![format!("Run '{}'", self.summary.run_id)];

        if let Some(verdicts) = &self.verdicts {
            lines.push(formatter.format_verdicts(verdicts));
        }
        lines.push(formatter.format_summary(&self.summary));

        if self.summary.complete {
            lines.push("All selected instances have a verdict.".to_string());
        } else if !self.summary.missing.is_empty() {
            lines.push(format!(
                "Missing verdicts ({}): {}",
                self.summary.missing.len(),
                self.summary.missing.join(", ")
            ));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: ReportArgs, config: Config, json_mode: bool) -> Result<()> {
    let report_dir = args
        .report_dir
        .unwrap_or_else(|| PathBuf::from(&config.report_dir));
    let store = FsReportStore::new(report_dir);

    let manifest = store
        .read_manifest(&args.run_id)
        .await
        .context("Failed to read run manifest")?;
    let (summary, verdicts) = summarize(&store, &args.run_id)
        .await
        .context("Failed to read run reports")?;

    if manifest.is_none() && verdicts.is_empty() {
        anyhow::bail!(
            "no reports for run '{}' under {}",
            args.run_id,
            store.root().display()
        );
    }

    output(
        &ReportOutput {
            summary,
            verdicts: args.instances.then_some(verdicts),
        },
        json_mode,
    );
    Ok(())
}
