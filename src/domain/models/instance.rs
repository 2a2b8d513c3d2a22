//! Task instances and predictions.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

/// Placeholder in a test command template that receives the shell-escaped
/// test identifiers.
pub const TESTS_PLACEHOLDER: &str = "{tests}";

/// One unit of evaluation: a repository revision, an issue, and the tests
/// that decide whether a fix works.
///
/// Dataset rows carry more fields than this; unknown ones are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInstance {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,

    #[serde(default)]
    pub problem_statement: String,

    /// Tests expected to fail before the fix and pass after.
    #[serde(
        default,
        alias = "FAIL_TO_PASS",
        deserialize_with = "deserialize_test_ids"
    )]
    pub fail_to_pass: BTreeSet<String>,

    /// Tests expected to pass both before and after the fix.
    #[serde(
        default,
        alias = "PASS_TO_PASS",
        deserialize_with = "deserialize_test_ids"
    )]
    pub pass_to_pass: BTreeSet<String>,

    /// Shell command run inside the checkout. `{tests}` is replaced with the
    /// selected test ids.
    #[serde(default = "default_test_command", alias = "test_cmd")]
    pub test_command_template: String,

    /// Diff that adds or updates the tests named above. Applied on top of the
    /// checkout before every test phase.
    #[serde(default)]
    pub test_patch: Option<String>,

    /// Commands run once after the environment is acquired.
    #[serde(default)]
    pub setup_commands: Vec<String>,

    /// Per-instance test phase timeout, overriding the configured default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub log_parser: LogParserKind,

    #[serde(default)]
    pub version: Option<String>,
}

fn default_test_command() -> String {
    format!("pytest -rA {TESTS_PLACEHOLDER}")
}

impl TaskInstance {
    /// Minimal instance, mostly useful for tests and fixtures.
    pub fn new(
        instance_id: impl Into<String>,
        repo: impl Into<String>,
        base_commit: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo: repo.into(),
            base_commit: base_commit.into(),
            problem_statement: String::new(),
            fail_to_pass: BTreeSet::new(),
            pass_to_pass: BTreeSet::new(),
            test_command_template: default_test_command(),
            test_patch: None,
            setup_commands: Vec::new(),
            timeout_secs: None,
            log_parser: LogParserKind::default(),
            version: None,
        }
    }

    pub fn with_fail_to_pass<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail_to_pass = tests.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pass_to_pass<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pass_to_pass = tests.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_test_command(mut self, template: impl Into<String>) -> Self {
        self.test_command_template = template.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Union of both test sets, sorted and de-duplicated.
    pub fn all_tests(&self) -> Vec<String> {
        self.fail_to_pass
            .union(&self.pass_to_pass)
            .cloned()
            .collect()
    }
}

/// Output grammar used to read per-test results from a test run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogParserKind {
    Pytest,
    Django,
    /// Try every known grammar and merge what matches.
    #[default]
    Auto,
}

/// A candidate fix for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prediction {
    pub instance_id: String,

    /// Unified diff. `None`, missing and `""` all mean "no patch".
    #[serde(default)]
    pub model_patch: Option<String>,

    #[serde(default = "default_model_name")]
    pub model_name_or_path: String,
}

fn default_model_name() -> String {
    "unknown".to_string()
}

impl Prediction {
    pub fn new(instance_id: impl Into<String>, model_patch: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            model_patch: Some(model_patch.into()),
            model_name_or_path: default_model_name(),
        }
    }

    pub fn patch_text(&self) -> &str {
        self.model_patch.as_deref().unwrap_or("")
    }
}

/// Test id lists arrive either as a JSON array or, in SWE-bench exports, as a
/// string holding a JSON-encoded array.
fn deserialize_test_ids<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Encoded(String),
        Null(()),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(ids) => Ok(ids.into_iter().collect()),
        Raw::Null(()) => Ok(BTreeSet::new()),
        Raw::Encoded(s) if s.trim().is_empty() => Ok(BTreeSet::new()),
        Raw::Encoded(s) => serde_json::from_str::<Vec<String>>(&s)
            .map(|ids| ids.into_iter().collect())
            .map_err(serde::de::Error::custom),
    }
}
