//! Port trait definitions (Hexagonal Architecture)
//!
//! - EnvironmentProvider: isolated execution contexts
//! - ReportStore: verdict persistence

pub mod environment;
pub mod report_store;

pub use environment::{EnvironmentHandle, EnvironmentProvider, EnvironmentSpec, ExecOutput};
pub use report_store::{is_valid_key, ReportStore};
