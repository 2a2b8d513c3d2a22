use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project-local configuration directory.
pub const PROJECT_DIR: &str = ".patchgrade";

/// Prefix for environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "PATCHGRADE_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_workers: {0}. Must be between 1 and 256")]
    InvalidMaxWorkers(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid timeout: {0} must be greater than 0")]
    InvalidTimeout(&'static str),

    #[error("Configuration file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the current directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. .patchgrade/config.yaml
    /// 3. .patchgrade/local.yaml
    /// 4. PATCHGRADE_* environment variables
    ///
    /// An explicit file replaces steps 2 and 3. CLI flags are applied on top
    /// by the caller.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        Self::load_from(Path::new("."), explicit)
    }

    /// Same as [`ConfigLoader::load`] with project files looked up under `root`.
    pub fn load_from(root: &Path, explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let config: Config = Self::figment(root, explicit)?
            .extract()
            .map_err(Box::new)?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(root: &Path, explicit: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        figment = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::MissingFile(path.to_path_buf()));
                }
                figment.merge(Yaml::file(path))
            }
            None => {
                let dir = root.join(PROJECT_DIR);
                figment
                    .merge(Yaml::file(dir.join("config.yaml")))
                    .merge(Yaml::file(dir.join("local.yaml")))
            }
        };

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Validate configuration after loading and after CLI overrides.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_workers == 0 || config.max_workers > 256 {
            return Err(ConfigError::InvalidMaxWorkers(config.max_workers));
        }

        if config.report_dir.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "report_dir cannot be empty".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.retry.max_retries));
        }

        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        if config.evaluation.test_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("evaluation.test_timeout_secs"));
        }
        if config.evaluation.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("evaluation.command_timeout_secs"));
        }

        if config.environment.git_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("environment.git_timeout_secs"));
        }

        let env = &config.environment;
        if env.workspace_root.trim().is_empty() || env.cache_dir.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "environment.workspace_root and environment.cache_dir cannot be empty".to_string(),
            ));
        }
        if !env.repo_url_template.contains("{repo}") {
            return Err(ConfigError::ValidationFailed(format!(
                "environment.repo_url_template '{}' must contain {{repo}}",
                env.repo_url_template
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_project_file(root: &Path, name: &str, contents: &str) {
        let dir = root.join(PROJECT_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.report_dir, "reports");
        assert_eq!(config.logging.level, "info");
        assert!(!config.evaluation.retry_infra_errors);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
max_workers: 16
report_dir: /data/reports
retry:
  max_retries: 5
evaluation:
  test_timeout_secs: 900
environment:
  keep_workspaces: true
logging:
  level: debug
  format: json
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.max_workers, 16);
        assert_eq!(config.report_dir, "/data/reports");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff_ms, 1_000);
        assert_eq!(config.evaluation.test_timeout_secs, 900);
        assert_eq!(config.evaluation.command_timeout_secs, 300);
        assert!(config.environment.keep_workspaces);
        assert_eq!(config.logging.format, "json");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_worker_bounds() {
        for bad in [0, 257] {
            let config = Config {
                max_workers: bad,
                ..Default::default()
            };
            assert!(matches!(
                ConfigLoader::validate(&config),
                Err(ConfigError::InvalidMaxWorkers(n)) if n == bad
            ));
        }

        let config = Config {
            max_workers: 256,
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(f)) if f == "xml"
        ));
    }

    #[test]
    fn test_validate_retry() {
        let mut config = Config::default();
        config.retry.max_retries = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxRetries(0))
        ));

        let mut config = Config::default();
        config.retry.initial_backoff_ms = 30000;
        config.retry.max_backoff_ms = 10000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(30000, 10000))
        ));
    }

    #[test]
    fn test_validate_timeouts_and_template() {
        let mut config = Config::default();
        config.evaluation.test_timeout_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTimeout("evaluation.test_timeout_secs"))
        ));

        let mut config = Config::default();
        config.environment.git_timeout_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTimeout("environment.git_timeout_secs"))
        ));

        let mut config = Config::default();
        config.environment.repo_url_template = "https://example.com/fixed.git".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_hierarchical_merging() {
        let root = tempfile::tempdir().unwrap();
        write_project_file(
            root.path(),
            "config.yaml",
            "max_workers: 5\nlogging:\n  level: info\n  format: json\n",
        );
        write_project_file(root.path(), "local.yaml", "max_workers: 15\nlogging:\n  level: debug\n");

        let config = temp_env::with_vars_unset(
            ["PATCHGRADE_MAX_WORKERS", "PATCHGRADE_LOGGING__LEVEL"],
            || ConfigLoader::load_from(root.path(), None).unwrap(),
        );

        assert_eq!(config.max_workers, 15, "Override should win");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }

    #[test]
    fn test_env_override() {
        let root = tempfile::tempdir().unwrap();
        write_project_file(root.path(), "config.yaml", "max_workers: 5\n");

        let config = temp_env::with_vars(
            [
                ("PATCHGRADE_MAX_WORKERS", Some("25")),
                ("PATCHGRADE_EVALUATION__RETRY_INFRA_ERRORS", Some("true")),
                ("PATCHGRADE_LOGGING__LEVEL", Some("warn")),
            ],
            || ConfigLoader::load_from(root.path(), None).unwrap(),
        );

        assert_eq!(config.max_workers, 25);
        assert!(config.evaluation.retry_infra_errors);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_explicit_file_replaces_project_files() {
        let root = tempfile::tempdir().unwrap();
        write_project_file(root.path(), "config.yaml", "max_workers: 5\nreport_dir: project\n");
        let explicit = root.path().join("ci.yaml");
        std::fs::write(&explicit, "max_workers: 2\n").unwrap();

        let config = temp_env::with_var_unset("PATCHGRADE_MAX_WORKERS", || {
            ConfigLoader::load_from(root.path(), Some(&explicit)).unwrap()
        });
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.report_dir, "reports");

        let missing = root.path().join("nope.yaml");
        assert!(matches!(
            ConfigLoader::load_from(root.path(), Some(&missing)),
            Err(ConfigError::MissingFile(_))
        ));
    }

    #[test]
    fn test_invalid_file_value_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_project_file(root.path(), "config.yaml", "max_workers: 0\n");

        let result = temp_env::with_var_unset("PATCHGRADE_MAX_WORKERS", || {
            ConfigLoader::load_from(root.path(), None)
        });
        assert!(matches!(result, Err(ConfigError::InvalidMaxWorkers(0))));
    }
}
