//! Progress reporting for runs using indicatif.
//!
//! The scheduler emits [`RunEvent`]s on a channel; [`spawn_progress`] turns
//! them into a single progress bar on stderr.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::VerdictKind;
use crate::services::{RunEvent, RunStats};

const PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg} (ETA: {eta})";
const PROGRESS_CHARS: &str = "█▓▒░ ";

/// Create a run progress bar. Hidden when `visible` is false.
pub fn create_progress_bar(total: u64, visible: bool) -> ProgressBar {
    let pb = ProgressBar::with_draw_target(
        Some(total),
        if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        },
    );
    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS);
    pb.set_style(style);
    if visible {
        pb.enable_steady_tick(Duration::from_millis(100));
    }
    pb
}

/// Extension trait for ProgressBar to add common utility methods
pub trait ProgressBarExt {
    /// Finish with a success message (green checkmark)
    fn finish_success(&self, message: impl Into<String>);

    /// Finish with a warning message (yellow !)
    fn finish_warning(&self, message: impl Into<String>);
}

impl ProgressBarExt for ProgressBar {
    fn finish_success(&self, message: impl Into<String>) {
        self.finish_with_message(format!("{} {}", style("✓").green(), message.into()));
    }

    fn finish_warning(&self, message: impl Into<String>) {
        self.finish_with_message(format!("{} {}", style("!").yellow(), message.into()));
    }
}

fn kind_label(kind: VerdictKind) -> String {
    let label = kind.as_str();
    match kind {
        VerdictKind::Resolved => style(label).green().to_string(),
        VerdictKind::Unresolved => style(label).red().to_string(),
        VerdictKind::PatchRejected | VerdictKind::BaselineBroken => style(label).yellow().to_string(),
        VerdictKind::InfraError => style(label).magenta().to_string(),
    }
}

fn completion_message(stats: &RunStats) -> String {
    let resolved = stats.by_kind.get(&VerdictKind::Resolved).copied().unwrap_or(0);
    format!(
        "{} evaluated, {resolved} resolved, {} skipped",
        stats.finished(),
        stats.skipped
    )
}

/// Drive a progress bar from run events until the channel closes.
///
/// With `visible` false, events are drained without drawing anything.
pub fn spawn_progress(mut events: mpsc::Receiver<RunEvent>, visible: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = create_progress_bar(0, visible);

        while let Some(event) = events.recv().await {
            match event {
                RunEvent::Started {
                    run_id,
                    to_evaluate,
                    skipped,
                } => {
                    pb.set_length(to_evaluate as u64);
                    if skipped > 0 {
                        pb.println(format!(
                            "{run_id}: {skipped} instance(s) already reported, skipping"
                        ));
                    }
                    pb.set_message(run_id);
                }
                RunEvent::StateChanged { instance_id, state } => {
                    if !state.is_terminal() {
                        pb.set_message(format!("{instance_id}: {}", state.as_str()));
                    }
                }
                RunEvent::InstanceFinished {
                    instance_id,
                    verdict,
                    failure,
                } => {
                    pb.inc(1);
                    match (verdict, failure) {
                        (Some(kind), _) => pb.println(format!("  {instance_id}: {}", kind_label(kind))),
                        (None, Some(reason)) => {
                            pb.println(format!("  {instance_id}: {}", style(reason).red()));
                        }
                        (None, None) => {}
                    }
                }
                RunEvent::Cancelling => {
                    pb.set_message("cancelling, waiting for in-flight instances");
                }
                RunEvent::Completed(stats) => {
                    if stats.cancelled > 0 {
                        pb.finish_warning(format!(
                            "{} ({} interrupted)",
                            completion_message(&stats),
                            stats.cancelled
                        ));
                    } else {
                        pb.finish_success(completion_message(&stats));
                    }
                }
            }
        }

        if !pb.is_finished() {
            pb.abandon();
        }
    })
}
