//! Test-log parsing: turns raw test output into per-test outcomes.
//!
//! Two grammars are recognized, pytest (`-rA` summary and verbose lines)
//! and Django's unittest runner (`test_x (mod.Class) ... ok`).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::models::{LogParserKind, TestOutcome};

pub const START_MARKER: &str = ">>>>> Start Test Output";
pub const END_MARKER: &str = ">>>>> End Test Output";

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ansi regex"));

static PYTEST_VERBOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+::\S.*?)\s+(PASSED|FAILED|ERROR|XFAIL|XPASS|SKIPPED)(?:\s+\[\s*\d+%\])?\s*$")
        .expect("valid pytest regex")
});

static DJANGO_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?) \.\.\. (ok|OK|FAIL|ERROR|skipped.*|expected failure|unexpected success)\s*$")
        .expect("valid django regex")
});

static DJANGO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+ \([\w.]+\)$").expect("valid django id regex"));

/// The region between the start and end markers, or all of `raw` when the
/// markers are missing. A missing end marker (killed run) takes the rest.
pub fn framed_output(raw: &str) -> &str {
    let Some(start) = raw.find(START_MARKER) else {
        return raw;
    };
    let body = &raw[start + START_MARKER.len()..];
    match body.find(END_MARKER) {
        Some(end) => &body[..end],
        None => body,
    }
}

/// Parse `output` with the given grammar. Later lines override earlier
/// ones for the same test id.
pub fn parse_log(kind: LogParserKind, output: &str) -> BTreeMap<String, TestOutcome> {
    let cleaned = ANSI.replace_all(framed_output(output), "");
    match kind {
        LogParserKind::Pytest => parse_pytest(&cleaned),
        LogParserKind::Django => parse_django(&cleaned),
        LogParserKind::Auto => {
            let mut outcomes = parse_django(&cleaned);
            outcomes.extend(parse_pytest(&cleaned));
            outcomes
        }
    }
}

fn pytest_status(status: &str) -> Option<TestOutcome> {
    match status {
        "PASSED" | "XFAIL" | "XPASS" => Some(TestOutcome::Pass),
        "FAILED" => Some(TestOutcome::Fail),
        "ERROR" => Some(TestOutcome::Error),
        "SKIPPED" => Some(TestOutcome::NotRun),
        _ => None,
    }
}

fn parse_pytest(output: &str) -> BTreeMap<String, TestOutcome> {
    let mut outcomes = BTreeMap::new();

    for line in output.lines().map(str::trim_end) {
        if let Some((status, rest)) = line.split_once(' ') {
            if let Some(outcome) = pytest_status(status) {
                // `SKIPPED [1] path:line: reason` carries no test id.
                if rest.starts_with('[') {
                    continue;
                }
                let id = rest.split(" - ").next().unwrap_or(rest).trim();
                if !id.is_empty() {
                    outcomes.insert(id.to_string(), outcome);
                }
                continue;
            }
        }
        if let Some(caps) = PYTEST_VERBOSE.captures(line) {
            if let Some(outcome) = pytest_status(&caps[2]) {
                outcomes.insert(caps[1].to_string(), outcome);
            }
        }
    }

    outcomes
}

fn django_status(status: &str) -> TestOutcome {
    match status {
        "ok" | "OK" | "expected failure" => TestOutcome::Pass,
        "FAIL" | "unexpected success" => TestOutcome::Fail,
        "ERROR" => TestOutcome::Error,
        _ => TestOutcome::NotRun,
    }
}

fn parse_django(output: &str) -> BTreeMap<String, TestOutcome> {
    let mut outcomes = BTreeMap::new();
    let mut previous: Option<&str> = None;

    for line in output.lines().map(str::trim_end) {
        if let Some(caps) = DJANGO_RESULT.captures(line) {
            let head = caps.get(1).map_or("", |m| m.as_str()).trim();
            // Tests with a docstring print the id on one line and the
            // docstring plus status on the next.
            let id = if DJANGO_ID.is_match(head) {
                Some(head)
            } else {
                previous.filter(|p| DJANGO_ID.is_match(p))
            };
            if let Some(id) = id {
                outcomes.insert(id.to_string(), django_status(&caps[2]));
            }
        }
        previous = Some(line.trim());
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framed_output() {
        let raw = format!("setup noise\n{START_MARKER}\nPASSED t::a\n{END_MARKER}\nPASSED t::b\n");
        assert_eq!(framed_output(&raw), "\nPASSED t::a\n");
        assert_eq!(framed_output("PASSED t::a"), "PASSED t::a");
        let cut = format!("{START_MARKER}\nPASSED t::a\n");
        assert_eq!(framed_output(&cut), "\nPASSED t::a\n");
    }

    #[test]
    fn test_pytest_summary_lines() {
        let out = "\
============ short test summary info ============
PASSED tests/test_a.py::test_ok
FAILED tests/test_a.py::test_bad - AssertionError: 1 != 2
ERROR tests/test_a.py::test_fixture - RuntimeError
XFAIL tests/test_a.py::test_known - reason
SKIPPED [1] tests/test_a.py:10: no network
PASSED tests/test_a.py::test_param[a b]
";
        let parsed = parse_log(LogParserKind::Pytest, out);
        assert_eq!(parsed["tests/test_a.py::test_ok"], TestOutcome::Pass);
        assert_eq!(parsed["tests/test_a.py::test_bad"], TestOutcome::Fail);
        assert_eq!(parsed["tests/test_a.py::test_fixture"], TestOutcome::Error);
        assert_eq!(parsed["tests/test_a.py::test_known"], TestOutcome::Pass);
        assert_eq!(parsed["tests/test_a.py::test_param[a b]"], TestOutcome::Pass);
        assert_eq!(parsed.len(), 5);
    }

    #[test]
    fn test_pytest_verbose_lines() {
        let out = "\
tests/test_b.py::test_one PASSED                                  [ 50%]
tests/test_b.py::test_two FAILED                                  [100%]
tests/test_b.py::test_three SKIPPED
";
        let parsed = parse_log(LogParserKind::Pytest, out);
        assert_eq!(parsed["tests/test_b.py::test_one"], TestOutcome::Pass);
        assert_eq!(parsed["tests/test_b.py::test_two"], TestOutcome::Fail);
        assert_eq!(parsed["tests/test_b.py::test_three"], TestOutcome::NotRun);
    }

    #[test]
    fn test_ansi_codes_stripped() {
        let out = "\x1b[32mPASSED\x1b[0m tests/t.py::test_green\n";
        let parsed = parse_log(LogParserKind::Pytest, out);
        assert_eq!(parsed["tests/t.py::test_green"], TestOutcome::Pass);
    }

    #[test]
    fn test_django_lines() {
        let out = "\
test_add (utils_tests.test_math.MathTests) ... ok
test_sub (utils_tests.test_math.MathTests) ... FAIL
test_div (utils_tests.test_math.MathTests) ... ERROR
test_skip (utils_tests.test_math.MathTests) ... skipped 'needs db'
test_xfail (utils_tests.test_math.MathTests) ... expected failure
test_doc (utils_tests.test_math.MathTests)
Division by zero raises. ... ok
";
        let parsed = parse_log(LogParserKind::Django, out);
        let key = |name: &str| format!("{name} (utils_tests.test_math.MathTests)");
        assert_eq!(parsed[&key("test_add")], TestOutcome::Pass);
        assert_eq!(parsed[&key("test_sub")], TestOutcome::Fail);
        assert_eq!(parsed[&key("test_div")], TestOutcome::Error);
        assert_eq!(parsed[&key("test_skip")], TestOutcome::NotRun);
        assert_eq!(parsed[&key("test_xfail")], TestOutcome::Pass);
        assert_eq!(parsed[&key("test_doc")], TestOutcome::Pass);
    }

    #[test]
    fn test_auto_merges_grammars() {
        let out = "\
test_add (m.T) ... ok
PASSED tests/t.py::test_x
";
        let parsed = parse_log(LogParserKind::Auto, out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["test_add (m.T)"], TestOutcome::Pass);
        assert_eq!(parsed["tests/t.py::test_x"], TestOutcome::Pass);
    }

    #[test]
    fn test_later_result_wins() {
        let out = "FAILED t.py::test_flaky\nPASSED t.py::test_flaky\n";
        let parsed = parse_log(LogParserKind::Pytest, out);
        assert_eq!(parsed["t.py::test_flaky"], TestOutcome::Pass);
    }
}
