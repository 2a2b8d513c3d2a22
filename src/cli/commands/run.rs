//! `patchgrade run`: evaluate predictions against a dataset split.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::dataset::{load_dataset, load_predictions};
use crate::adapters::environments::LocalGitProvider;
use crate::adapters::reports::FsReportStore;
use crate::cli::output::{output, spawn_progress, CommandOutput, TableFormatter};
use crate::domain::errors::{HarnessError, SelectionError};
use crate::domain::models::Config;
use crate::domain::ports::{is_valid_key, EnvironmentProvider, ReportStore};
use crate::infrastructure::config::ConfigLoader;
use crate::services::{
    select_instances, summarize, PredictionSet, RunPlan, RunSummary, Scheduler,
};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Dataset file (JSON or JSONL), or a directory holding `<split>.jsonl`
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Dataset split
    #[arg(short, long, default_value = "test")]
    pub split: String,

    /// Predictions file (JSON or JSONL)
    #[arg(short, long)]
    pub predictions: PathBuf,

    /// Run identifier, used as the report namespace
    #[arg(short, long)]
    pub run_id: String,

    /// Maximum concurrent evaluations [default: from config]
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub max_workers: Option<u16>,

    /// Only evaluate these instance ids (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub instance_ids: Vec<String>,

    /// Report directory [default: from config]
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Re-evaluate instances that already have a verdict
    #[arg(long)]
    pub rewrite_reports: bool,

    /// Re-evaluate instances whose verdict is an infra error
    #[arg(long)]
    pub retry_infra_errors: bool,

    /// Load and validate inputs, print the selection, evaluate nothing
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(max_workers) = self.max_workers {
            config.max_workers = usize::from(max_workers);
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = dir.display().to_string();
        }
        if self.retry_infra_errors {
            config.evaluation.retry_infra_errors = true;
        }
    }

    fn allowlist(&self) -> Option<&[String]> {
        if self.instance_ids.is_empty() {
            None
        } else {
            Some(&self.instance_ids)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RejectedInstance {
    pub instance_id: String,
    pub reason: String,
}

impl From<&SelectionError> for RejectedInstance {
    fn from(err: &SelectionError) -> Self {
        Self {
            instance_id: err.instance_id().to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DryRunOutput {
    pub run_id: String,
    pub dataset_size: usize,
    pub predictions: usize,
    pub selected: Vec<String>,
    pub rejected: Vec<RejectedInstance>,
    pub duplicate_predictions: Vec<String>,
}

impl CommandOutput for DryRunOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Dry run for '{}'", self.run_id),
            format!("  Dataset instances: {}", self.dataset_size),
            format!("  Predictions:       {}", self.predictions),
            format!("  Selected:          {}", self.selected.len()),
        ];
        if !self.duplicate_predictions.is_empty() {
            lines.push(format!(
                "  Duplicate predictions ignored: {}",
                self.duplicate_predictions.join(", ")
            ));
        }
        for rejected in &self.rejected {
            lines.push(format!("  skipped: {}", rejected.reason));
        }
        if !self.selected.is_empty() {
            lines.push(String::new());
            lines.extend(self.selected.iter().map(|id| format!("  {id}")));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub run_id: String,
    pub evaluated: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub cancelled: bool,
    pub rejected: Vec<RejectedInstance>,
    pub summary: RunSummary,
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "Run '{}': {} evaluated, {} already reported",
            self.run_id, self.evaluated, self.skipped
        )];
        for rejected in &self.rejected {
            lines.push(format!("  not evaluated: {}", rejected.reason));
        }
        lines.push(TableFormatter::new().format_summary(&self.summary));
        if !self.summary.complete && !self.summary.missing.is_empty() {
            lines.push(format!(
                "{} selected instance(s) have no verdict yet; rerun with --run-id {} to resume",
                self.summary.missing.len(),
                self.run_id
            ));
        }
        lines.join("\n")
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight instances");
            token.cancel();
        }
    })
}

pub async fn execute(args: RunArgs, mut config: Config, json_mode: bool) -> Result<()> {
    args.apply_to(&mut config);
    ConfigLoader::validate(&config)?;

    if !is_valid_key(&args.run_id) {
        return Err(HarnessError::Config(format!(
            "run id '{}' must contain only ASCII letters, digits, '-', '_' or '.'",
            args.run_id
        ))
        .into());
    }

    let dataset = load_dataset(&args.dataset, &args.split).context("Failed to load dataset")?;
    let predictions = PredictionSet::from_predictions(
        load_predictions(&args.predictions).context("Failed to load predictions")?,
    );
    let selection = select_instances(&dataset, &predictions, args.allowlist());
    let rejected: Vec<RejectedInstance> = selection.rejected.iter().map(Into::into).collect();
    for err in &selection.rejected {
        warn!(instance_id = %err.instance_id(), "{err}");
    }

    if args.dry_run {
        output(
            &DryRunOutput {
                run_id: args.run_id.clone(),
                dataset_size: dataset.len(),
                predictions: predictions.len(),
                selected: selection.selected.clone(),
                rejected,
                duplicate_predictions: predictions.duplicates().to_vec(),
            },
            json_mode,
        );
        return Ok(());
    }

    let dataset_label = args.dataset.display().to_string();
    let plan = RunPlan::new(
        args.run_id.clone(),
        dataset_label,
        args.split.clone(),
        &dataset,
        &predictions,
        &selection,
    )
    .with_rewrite_reports(args.rewrite_reports)
    .with_retry_infra_errors(config.evaluation.retry_infra_errors);

    let provider: Arc<dyn EnvironmentProvider> = Arc::new(LocalGitProvider::new(&config.environment));
    let store: Arc<dyn ReportStore> = Arc::new(FsReportStore::new(&config.report_dir));
    let scheduler = Scheduler::from_config(provider, Arc::clone(&store), &config);

    info!(
        run_id = %args.run_id,
        selected = plan.work.len(),
        max_workers = config.max_workers,
        report_dir = %config.report_dir,
        "starting run"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let (event_tx, event_rx) = mpsc::channel(256);
    let show_progress = !json_mode && console::Term::stderr().is_term();
    let progress = spawn_progress(event_rx, show_progress);

    let result = scheduler.run(plan, cancel, Some(event_tx)).await;
    interrupt.abort();
    let _ = progress.await;
    let outcome = result.context("Run aborted")?;

    let (summary, _) = summarize(store.as_ref(), &args.run_id)
        .await
        .context("Failed to read run reports")?;

    output(
        &RunOutput {
            run_id: outcome.run_id.clone(),
            evaluated: outcome.stats.finished(),
            skipped: outcome.skipped.len(),
            interrupted: outcome.stats.cancelled,
            cancelled: outcome.cancelled,
            rejected,
            summary,
        },
        json_mode,
    );

    if outcome.cancelled {
        anyhow::bail!(
            "run interrupted; rerun with --run-id {} to resume",
            outcome.run_id
        );
    }
    Ok(())
}
