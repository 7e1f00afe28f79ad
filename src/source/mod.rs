//! Event sources
//!
//! A source produces [`Event`]s into the staging buffer of a connector through an
//! [`EventEmitter`]. Starting a source never blocks; production runs on tasks owned by
//! the source until [`EventSource::shutdown`] is called.

use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use serde::Deserialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::core::errors::StreamerResult;
use crate::event::Event;

pub mod change_stream;
pub mod mongo;

pub use change_stream::{ChangeFeed, ChangeStreamSource, FeedOpener};
pub use mongo::MongoSource;

/// Producer side of a connection
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Name the source was registered under
    fn name(&self) -> &str;

    /// Begin producing into `emitter` and return immediately.
    ///
    /// Errors are setup errors: the connector that called `start` is not established.
    async fn start(&self, emitter: EventEmitter) -> StreamerResult<()>;

    /// Stop producing and wait for every production task to finish
    async fn shutdown(&self);
}

/// What to do with an event when the staging buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for room; backpressure reaches the upstream cursor
    #[default]
    Block,
    /// Discard the event that did not fit
    DropNewest,
}

/// Why an emit did not enqueue the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// The connector is gone; the producer should stop
    Closed,
    /// The buffer was full and the policy discarded the event
    Dropped,
}

/// Writer end of a connector's staging buffer
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<Event>,
    overflow: OverflowPolicy,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<Event>, overflow: OverflowPolicy) -> Self {
        Self { tx, overflow }
    }

    pub async fn emit(&self, event: Event) -> Result<(), EmitError> {
        match self.overflow {
            OverflowPolicy::Block => self.tx.send(event).await.map_err(|_| EmitError::Closed),
            OverflowPolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(EmitError::Dropped),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(EmitError::Closed),
            },
        }
    }
}

/// Predicate selecting which change notifications a watch forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    #[default]
    InsertOnly,
    UpdateOnly,
    DeleteOnly,
    All,
}

impl WatchMode {
    /// Resolve a configured mode name; unknown names fall back to the default
    pub fn from_name(name: &str) -> Self {
        match Self::parse(name) {
            Some(mode) => mode,
            None => {
                warn!(
                    "Unknown watch mode '{}', falling back to '{}'",
                    name,
                    Self::default()
                );
                Self::default()
            }
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "insert-only" => Some(Self::InsertOnly),
            "update-only" => Some(Self::UpdateOnly),
            "delete-only" => Some(Self::DeleteOnly),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn operation_type(&self) -> Option<&'static str> {
        match self {
            Self::InsertOnly => Some("insert"),
            Self::UpdateOnly => Some("update"),
            Self::DeleteOnly => Some("delete"),
            Self::All => None,
        }
    }

    /// Aggregation pipeline applied server-side when the change stream is opened
    pub fn pipeline(&self) -> Vec<Document> {
        match self.operation_type() {
            Some(op) => vec![doc! { "$match": { "operationType": op } }],
            None => Vec::new(),
        }
    }

    /// Whether a decoded notification passes this predicate
    pub fn matches(&self, event: &Event) -> bool {
        match self.operation_type() {
            Some(op) => event.operation_type() == Some(op),
            None => true,
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsertOnly => write!(f, "insert-only"),
            Self::UpdateOnly => write!(f, "update-only"),
            Self::DeleteOnly => write!(f, "delete-only"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Runtime failure of a single watch, reported out of band
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source: String,
    pub collection: String,
    pub kind: FailureKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// A notification was dropped because it could not be decoded
    Decode(String),
    /// The watch gave up; no more events will come from it
    Terminated(String),
}

impl SourceFailure {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FailureKind::Terminated(_))
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Decode(msg) => write!(
                f,
                "source '{}' dropped a notification from '{}': {}",
                self.source, self.collection, msg
            ),
            FailureKind::Terminated(msg) => write!(
                f,
                "source '{}' stopped watching '{}': {}",
                self.source, self.collection, msg
            ),
        }
    }
}

/// Side channel for watch failures; logs when nobody listens
#[derive(Debug, Clone, Default)]
pub struct FailureReporter {
    tx: Option<mpsc::UnboundedSender<SourceFailure>>,
}

impl FailureReporter {
    pub fn new(tx: mpsc::UnboundedSender<SourceFailure>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn report(&self, failure: SourceFailure) {
        let failure = match &self.tx {
            Some(tx) => match tx.send(failure) {
                Ok(()) => return,
                Err(mpsc::error::SendError(failure)) => failure,
            },
            None => failure,
        };
        if failure.is_terminal() {
            error!("{}", failure);
        } else {
            warn!("{}", failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Fields, Value};
    use std::time::Duration;

    fn change(op: &str) -> Event {
        Event::new(Fields::from_iter([(
            "operationType",
            Value::String(op.to_string()),
        )]))
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(WatchMode::from_name("insert-only"), WatchMode::InsertOnly);
        assert_eq!(WatchMode::from_name("ALL"), WatchMode::All);
        assert_eq!(WatchMode::from_name("upserts"), WatchMode::InsertOnly);
        assert_eq!(WatchMode::parse("upserts"), None);
        assert_eq!(WatchMode::DeleteOnly.to_string(), "delete-only");
    }

    #[test]
    fn test_insert_only_predicate() {
        let mode = WatchMode::InsertOnly;
        assert_eq!(
            mode.pipeline(),
            vec![doc! { "$match": { "operationType": "insert" } }]
        );
        assert!(mode.matches(&change("insert")));
        assert!(!mode.matches(&change("update")));
        assert!(!mode.matches(&change("delete")));
        assert!(!mode.matches(&Event::default()));

        assert!(WatchMode::All.pipeline().is_empty());
        assert!(WatchMode::All.matches(&change("drop")));
    }

    #[tokio::test]
    async fn test_blocking_emit_waits_for_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::new(tx, OverflowPolicy::Block);

        emitter.emit(change("insert")).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), emitter.emit(change("insert")));
        assert!(blocked.await.is_err());

        rx.recv().await.unwrap();
        emitter.emit(change("insert")).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_newest_discards_when_full() {
        let (tx, rx) = mpsc::channel(1);
        let emitter = EventEmitter::new(tx, OverflowPolicy::DropNewest);

        assert_eq!(emitter.emit(change("insert")).await, Ok(()));
        assert_eq!(emitter.emit(change("insert")).await, Err(EmitError::Dropped));

        drop(rx);
        assert_eq!(emitter.emit(change("insert")).await, Err(EmitError::Closed));
    }

    #[tokio::test]
    async fn test_reporter_forwards_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = FailureReporter::new(tx);
        reporter.report(SourceFailure {
            source: "orders".to_string(),
            collection: "orders".to_string(),
            kind: FailureKind::Terminated("cursor closed".to_string()),
        });

        let failure = rx.recv().await.unwrap();
        assert!(failure.is_terminal());
        assert_eq!(
            failure.to_string(),
            "source 'orders' stopped watching 'orders': cursor closed"
        );
    }
}
