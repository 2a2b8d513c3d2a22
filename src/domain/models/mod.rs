pub mod config;
pub mod evaluation;
pub mod instance;
pub mod outcome;
pub mod verdict;

pub use config::{Config, EnvironmentConfig, EvaluationConfig, LoggingConfig, RetryConfig};
pub use evaluation::{EvaluationState, FailureReason};
pub use instance::{LogParserKind, Prediction, TaskInstance, TESTS_PLACEHOLDER};
pub use outcome::{PhaseResults, TestOutcome, TestPhase, TestTransition};
pub use verdict::{RunManifest, Verdict, VerdictKind, REPORT_SCHEMA_VERSION};
