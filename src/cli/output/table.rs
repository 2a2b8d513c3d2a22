//! Table output formatting for run summaries and verdict listings using
//! comfy-table.

use std::env;

use comfy_table::{presets, Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::cli::output::truncate;
use crate::domain::models::{Verdict, VerdictKind};
use crate::services::RunSummary;

/// Table formatter for CLI output
pub struct TableFormatter {
    /// Whether to use colors in output
    use_colors: bool,
    /// Maximum width for tables (None = auto)
    max_width: Option<usize>,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    pub fn with_config(use_colors: bool, max_width: Option<usize>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// One row per verdict kind plus totals.
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        let mut table = self.create_base_table();
        table.set_header(vec![
            Cell::new("Verdict").add_attribute(Attribute::Bold),
            Cell::new("Count").add_attribute(Attribute::Bold),
        ]);

        for kind in VerdictKind::ALL {
            table.add_row(vec![
                self.kind_cell(kind),
                Cell::new(summary.count(kind)).set_alignment(CellAlignment::Right),
            ]);
        }
        table.add_row(vec![
            Cell::new("reported").add_attribute(Attribute::Bold),
            Cell::new(summary.reported).set_alignment(CellAlignment::Right),
        ]);
        if let Some(selected) = summary.selected {
            table.add_row(vec![
                Cell::new("selected"),
                Cell::new(selected).set_alignment(CellAlignment::Right),
            ]);
        }
        table.add_row(vec![
            Cell::new("resolved rate"),
            Cell::new(format!("{:.1}%", summary.resolved_rate() * 100.0))
                .set_alignment(CellAlignment::Right),
        ]);

        table.to_string()
    }

    /// One row per instance.
    pub fn format_verdicts(&self, verdicts: &[Verdict]) -> String {
        let mut table = self.create_base_table();
        table.set_header(vec![
            Cell::new("Instance").add_attribute(Attribute::Bold),
            Cell::new("Verdict").add_attribute(Attribute::Bold),
            Cell::new("Applied").add_attribute(Attribute::Bold),
            Cell::new("F2P").add_attribute(Attribute::Bold),
            Cell::new("P2P").add_attribute(Attribute::Bold),
            Cell::new("Time").add_attribute(Attribute::Bold),
            Cell::new("Error").add_attribute(Attribute::Bold),
        ]);

        for verdict in verdicts {
            table.add_row(vec![
                Cell::new(&verdict.instance_id),
                self.kind_cell(verdict.kind),
                Cell::new(if verdict.patch_applied { "yes" } else { "no" }),
                Cell::new(passing_ratio(&verdict.fail_to_pass_results)),
                Cell::new(passing_ratio(&verdict.pass_to_pass_results)),
                Cell::new(format!("{}s", verdict.duration_secs())),
                Cell::new(
                    verdict
                        .error
                        .as_deref()
                        .map_or_else(|| "-".to_string(), |e| truncate(e, 40)),
                ),
            ]);
        }

        table.to_string()
    }

    fn kind_cell(&self, kind: VerdictKind) -> Cell {
        let cell = Cell::new(kind.as_str());
        if self.use_colors {
            cell.fg(kind_color(kind))
        } else {
            cell
        }
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);

        if let Some(width) = self.max_width {
            table.set_width(u16::try_from(width).unwrap_or(u16::MAX));
        }

        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if color output is supported
fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }

    if let Ok(term) = env::var("TERM") {
        if term == "dumb" {
            return false;
        }
    }

    console::colors_enabled()
}

fn kind_color(kind: VerdictKind) -> Color {
    match kind {
        VerdictKind::Resolved => Color::Green,
        VerdictKind::Unresolved => Color::Red,
        VerdictKind::PatchRejected => Color::Yellow,
        VerdictKind::BaselineBroken => Color::DarkYellow,
        VerdictKind::InfraError => Color::Magenta,
    }
}

/// `passing/total` after the patch.
fn passing_ratio(results: &std::collections::BTreeMap<String, crate::domain::models::TestTransition>) -> String {
    if results.is_empty() {
        return "-".to_string();
    }
    let passing = results.values().filter(|t| t.after.is_pass()).count();
    format!("{passing}/{}", results.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{TestOutcome, TestTransition};
    use chrono::Utc;

    fn summary() -> RunSummary {
        let mut resolved = Verdict::infra_error("run", "a-1", "m", "x", Utc::now());
        resolved.kind = VerdictKind::Resolved;
        resolved.error = None;
        let failed = Verdict::infra_error("run", "b-2", "m", "acquire failed", Utc::now());
        RunSummary::from_verdicts("run", &[resolved, failed], None)
    }

    #[test]
    fn test_format_summary() {
        let formatter = TableFormatter::with_config(false, None);
        let output = formatter.format_summary(&summary());

        assert!(output.contains("resolved"));
        assert!(output.contains("infra_error"));
        assert!(output.contains("50.0%"));
    }

    #[test]
    fn test_format_verdicts() {
        let mut verdict = Verdict::infra_error("run", "a-1", "m", "acquire failed", Utc::now());
        verdict.fail_to_pass_results.insert(
            "t1".into(),
            TestTransition {
                before: TestOutcome::Fail,
                after: TestOutcome::Pass,
            },
        );
        verdict.fail_to_pass_results.insert(
            "t2".into(),
            TestTransition {
                before: TestOutcome::Fail,
                after: TestOutcome::Fail,
            },
        );

        let formatter = TableFormatter::with_config(false, Some(160));
        let output = formatter.format_verdicts(&[verdict]);

        assert!(output.contains("a-1"));
        assert!(output.contains("1/2"));
        assert!(output.contains("acquire failed"));
    }
}
