//! Core module containing configuration, error handling and retry policy
//!
//! This module provides the basic building blocks shared by sources, sinks and the
//! connector.

pub mod config;
pub mod errors;
pub mod retry;

// Re-export for convenience
pub use config::StreamerConfig;
pub use errors::{StreamerError, StreamerResult};
pub use retry::RetryPolicy;
