//! Adapters for the outside world: datasets, environments, report storage.

pub mod dataset;
pub mod environments;
pub mod reports;
