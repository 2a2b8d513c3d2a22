//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber, with optional
//! rolling JSON files through tracing-appender.

pub mod logger;

pub use logger::{LogFormat, LoggerImpl};
