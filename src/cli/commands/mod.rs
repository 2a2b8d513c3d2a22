//! CLI command implementations.

pub mod report;
pub mod run;

pub use report::ReportArgs;
pub use run::RunArgs;
