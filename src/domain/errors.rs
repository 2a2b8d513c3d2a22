//! Domain errors for the patchgrade evaluation harness.

use thiserror::Error;

/// Errors raised by an environment provider.
///
/// Only [`EnvironmentError::Unavailable`] and [`EnvironmentError::Network`]
/// are transient; everything else is a definitive outcome for the call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("Environment capacity unavailable: {0}")]
    Unavailable(String),

    #[error("Network error talking to environment provider: {0}")]
    Network(String),

    #[error("Command timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Command could not be executed: {0}")]
    Exec(String),

    #[error("Environment setup failed: {0}")]
    Setup(String),

    #[error("Unknown or already released environment handle: {0}")]
    UnknownHandle(String),
}

impl EnvironmentError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Network(_))
    }
}

/// Errors raised by the report store.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error on report {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt report {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid report key '{0}': must be a plain path component")]
    InvalidKey(String),

    #[error(
        "Run '{run_id}' already holds reports with schema version {found}, this build writes {expected}; \
         pass --rewrite-reports or choose a new run id"
    )]
    SchemaMismatch {
        run_id: String,
        found: u32,
        expected: u32,
    },

    #[error(
        "Run '{run_id}' was started against {existing}, refusing to mix in {requested}; \
         pass --rewrite-reports or choose a new run id"
    )]
    IncompatibleRun {
        run_id: String,
        existing: String,
        requested: String,
    },
}

/// Why a requested instance was not selected for evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Instance {0} not found in dataset")]
    NotInDataset(String),

    #[error("Instance {0} has no prediction")]
    NoPrediction(String),

    #[error("Prediction {0} does not match any dataset instance")]
    UnknownPrediction(String),

    #[error("Instance id '{0}' is not a valid report key")]
    InvalidId(String),
}

impl SelectionError {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::NotInDataset(id)
            | Self::NoPrediction(id)
            | Self::UnknownPrediction(id)
            | Self::InvalidId(id) => id,
        }
    }
}

/// Top-level harness errors.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("Reporting failed, aborting run: {0}")]
    Report(#[from] ReportError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

pub type HarnessResult<T> = Result<T, HarnessError>;
