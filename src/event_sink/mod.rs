//! Event sinks
//!
//! A sink accepts one [`Event`] at a time. The connector calls [`EventSink::send_event`]
//! from several dispatch workers at once, so implementations must be safe under
//! concurrent invocation.

use crate::core::errors::StreamerResult;
use crate::event::Event;
use async_trait::async_trait;

pub mod stdout;
pub mod webhook;

pub use stdout::StdoutSink;
pub use webhook::{WebhookSink, WebhookSinkConfig};

/// Consumer side of a connection
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Name the sink was registered under
    fn name(&self) -> &str;

    /// Deliver one event
    async fn send_event(&self, event: &Event) -> StreamerResult<()>;
}
