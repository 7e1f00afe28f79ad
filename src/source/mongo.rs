//! MongoDB change-stream source

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{Document, RawDocumentBuf, doc};
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::event::ResumeToken;
use mongodb::options::ChangeStreamOptions;
use mongodb::{Client, Collection, Database};
use std::time::Duration;
use tracing::info;

use super::change_stream::{ChangeFeed, ChangeStreamSource, FeedOpener};
use super::{EventEmitter, EventSource, FailureReporter, WatchMode};
use crate::core::errors::{StreamerError, StreamerResult};
use crate::core::retry::RetryPolicy;

/// How long to wait for the initial server handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
impl ChangeFeed for ChangeStream<RawDocumentBuf> {
    async fn next_change(&mut self) -> Option<StreamerResult<RawDocumentBuf>> {
        self.next().await.map(|r| r.map_err(StreamerError::from))
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        ChangeStream::resume_token(self)
    }
}

/// Change feed of a single collection
pub struct CollectionFeed {
    collection: Collection<Document>,
}

#[async_trait]
impl FeedOpener for CollectionFeed {
    type Feed = ChangeStream<RawDocumentBuf>;

    fn collection(&self) -> &str {
        self.collection.name()
    }

    async fn open(
        &self,
        mode: WatchMode,
        resume_after: Option<ResumeToken>,
    ) -> StreamerResult<Self::Feed> {
        let mut options = ChangeStreamOptions::default();
        options.resume_after = resume_after;

        let stream = self
            .collection
            .watch()
            .pipeline(mode.pipeline())
            .with_options(options)
            .await?;
        Ok(stream.with_type::<RawDocumentBuf>())
    }
}

/// Source watching collections of one MongoDB database
pub struct MongoSource {
    db: Database,
    inner: ChangeStreamSource<CollectionFeed>,
}

impl MongoSource {
    pub fn new<S: Into<String>>(
        name: S,
        db: Database,
        retry: RetryPolicy,
        reporter: FailureReporter,
    ) -> Self {
        Self {
            db,
            inner: ChangeStreamSource::new(name, retry, reporter),
        }
    }

    /// Connect to `uri` and verify the server answers before returning the database handle
    pub async fn connect(uri: &str, database: &str) -> StreamerResult<Database> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StreamerError::connection("invalid MongoDB connection string", e))?;
        let db = client.database(database);

        match tokio::time::timeout(CONNECT_TIMEOUT, db.run_command(doc! { "ping": 1 })).await {
            Ok(Ok(_)) => {
                info!("Connected to MongoDB database '{}'", database);
                Ok(db)
            }
            Ok(Err(e)) => Err(StreamerError::connection(
                format!("failed to reach MongoDB database '{}'", database),
                e,
            )),
            Err(elapsed) => Err(StreamerError::connection(
                format!(
                    "timed out after {:?} connecting to MongoDB database '{}'",
                    CONNECT_TIMEOUT, database
                ),
                elapsed,
            )),
        }
    }

    /// Open a change stream on `collection` filtered by `mode`
    pub async fn watch(&self, collection: &str, mode: WatchMode) -> StreamerResult<()> {
        let opener = CollectionFeed {
            collection: self.db.collection::<Document>(collection),
        };
        self.inner.register(opener, mode).await
    }
}

#[async_trait]
impl EventSource for MongoSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self, emitter: EventEmitter) -> StreamerResult<()> {
        self.inner.start(emitter).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
