//! Streamer - change-data-capture connector
//!
//! Watches MongoDB change streams and forwards every matching change notification to a
//! downstream sink (standard output or a webhook). Each named connection pairs one
//! source with one sink through a bounded staging buffer and a fixed-size pool of
//! concurrent dispatch workers.

pub mod connector;
pub mod core;
pub mod engine;
pub mod event;
pub mod event_sink;
pub mod source;

pub use connector::{Pipeline, PipelineSettings, connect};
pub use crate::core::{StreamerConfig, StreamerError, StreamerResult};
pub use event::{Event, Value};
pub use event_sink::EventSink;
pub use source::EventSource;
