//! patchgrade - evaluation harness for candidate patches
//!
//! Given a dataset of task instances (repository, base commit, tests that
//! must flip from failing to passing and tests that must keep passing) and a
//! set of predicted patches, patchgrade evaluates every prediction in its own
//! isolated environment and records a verdict per instance.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and the port traits
//! - **Service Layer** (`services`): selection, patching, test runs,
//!   classification and the bounded worker pool
//! - **Adapters** (`adapters`): datasets, environment providers, report store
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use patchgrade::{Config, FsReportStore, LocalGitProvider, RunPlan, Scheduler};
//!
//! let config = Config::default();
//! let store = Arc::new(FsReportStore::new(&config.report_dir));
//! let provider = Arc::new(LocalGitProvider::new(&config.environment));
//! let scheduler = Scheduler::from_config(provider, store, &config);
//! let outcome = scheduler.run(plan, CancellationToken::new(), None).await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::environments::{LocalGitProvider, MockEnvironmentProvider, MockScript};
pub use adapters::reports::FsReportStore;
pub use domain::errors::{EnvironmentError, HarnessError, HarnessResult, ReportError, SelectionError};
pub use domain::models::{
    Config, EvaluationState, FailureReason, PhaseResults, Prediction, RunManifest, TaskInstance,
    TestOutcome, TestTransition, Verdict, VerdictKind,
};
pub use domain::ports::{EnvironmentProvider, ReportStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    select_instances, Evaluator, PredictionSet, RunEvent, RunOutcome, RunPlan, RunSummary,
    Scheduler, Selection,
};
