//! Domain layer for the patchgrade harness
//!
//! Models, errors, and the port traits that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{
    EnvironmentError, HarnessError, HarnessResult, ReportError, SelectionError,
};
