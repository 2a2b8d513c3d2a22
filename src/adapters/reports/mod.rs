//! Report store implementations.

pub mod fs_store;

pub use fs_store::FsReportStore;
