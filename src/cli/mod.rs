//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::errors::{HarnessError, ReportError};
use crate::infrastructure::config::ConfigError;

pub use commands::{ReportArgs, RunArgs};

#[derive(Parser, Debug)]
#[command(name = "patchgrade")]
#[command(about = "Evaluate candidate patches against repository test suites", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file, replacing .patchgrade/config.yaml and local.yaml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate predictions for a dataset split
    Run(RunArgs),
    /// Summarize the verdicts of a run
    Report(ReportArgs),
}

/// Process exit status for a failed command: 2 for configuration and
/// incompatible-run errors, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 2;
        }
        if matches!(cause.downcast_ref::<HarnessError>(), Some(HarnessError::Config(_))) {
            return 2;
        }
        if matches!(
            cause.downcast_ref::<ReportError>(),
            Some(ReportError::SchemaMismatch { .. } | ReportError::IncompatibleRun { .. })
        ) {
            return 2;
        }
    }
    1
}

/// Print `err` and return the exit status to use.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) -> i32 {
    if json_mode {
        let body = serde_json::json!({ "error": format!("{err:#}") });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("{} {err:#}", console::style("error:").red().bold());
    }
    exit_code(err)
}
