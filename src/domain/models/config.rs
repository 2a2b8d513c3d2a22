use serde::{Deserialize, Serialize};

/// Main configuration structure for patchgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Maximum number of concurrent evaluations (1-256)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Directory that holds one sub-directory per run id
    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Retry policy for transient environment errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Test execution settings
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Local environment provider settings
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

const fn default_max_workers() -> usize {
    4
}

fn default_report_dir() -> String {
    "reports".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            report_dir: default_report_dir(),
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
            evaluation: EvaluationConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Test execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationConfig {
    /// Test phase timeout when the instance does not set one
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// Timeout for setup, git and file commands
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Re-evaluate instances whose existing verdict is an infra error
    #[serde(default)]
    pub retry_infra_errors: bool,
}

const fn default_test_timeout_secs() -> u64 {
    1_800
}

const fn default_command_timeout_secs() -> u64 {
    300
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            retry_infra_errors: false,
        }
    }
}

/// Local git environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EnvironmentConfig {
    /// Where per-evaluation checkouts are created
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    /// Where bare repository mirrors are cached
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Clone URL for a dataset `repo` value; `{repo}` is substituted
    #[serde(default = "default_repo_url_template")]
    pub repo_url_template: String,

    /// Keep checkouts on release (debugging only)
    #[serde(default)]
    pub keep_workspaces: bool,

    /// Upper bound for mirror clone/fetch and checkout commands
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
}

fn default_workspace_root() -> String {
    ".patchgrade/workspaces".to_string()
}

fn default_cache_dir() -> String {
    ".patchgrade/mirrors".to_string()
}

fn default_repo_url_template() -> String {
    "https://github.com/{repo}.git".to_string()
}

const fn default_git_timeout_secs() -> u64 {
    600
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            cache_dir: default_cache_dir(),
            repo_url_template: default_repo_url_template(),
            keep_workspaces: false,
            git_timeout_secs: default_git_timeout_secs(),
        }
    }
}
