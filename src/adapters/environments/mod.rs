//! Environment provider implementations.

pub mod local;
pub mod mock;

pub use local::LocalGitProvider;
pub use mock::{MockEnvironmentProvider, MockScript, MockStats};
