//! Change-stream watcher
//!
//! [`ChangeStreamSource`] owns any number of independent watches. Each watch is a
//! persistent cursor over one collection's change feed, filtered by a [`WatchMode`].
//! Registration opens the cursor immediately so that connectivity problems surface as
//! setup errors; `start` then spawns one task per watch into a [`JoinSet`] owned by the
//! source, every task tied to the source's cancellation token.
//!
//! The cursor itself sits behind [`ChangeFeed`] / [`FeedOpener`] so that the watch loop
//! can run against MongoDB or a scripted feed.

use async_trait::async_trait;
use mongodb::bson::RawDocumentBuf;
use mongodb::change_stream::event::ResumeToken;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    EmitError, EventEmitter, EventSource, FailureKind, FailureReporter, SourceFailure, WatchMode,
};
use crate::core::errors::{StreamerError, StreamerResult};
use crate::core::retry::RetryPolicy;
use crate::event::Event;

/// An open cursor over a change feed
#[async_trait]
pub trait ChangeFeed: Send + 'static {
    /// Wait for the next raw notification; `None` once the server closed the cursor
    async fn next_change(&mut self) -> Option<StreamerResult<RawDocumentBuf>>;

    /// Position to resume from after the last notification handed out
    fn resume_token(&self) -> Option<ResumeToken>;
}

/// Opens (and reopens) the change feed of one collection
#[async_trait]
pub trait FeedOpener: Send + Sync + 'static {
    type Feed: ChangeFeed;

    fn collection(&self) -> &str;

    async fn open(
        &self,
        mode: WatchMode,
        resume_after: Option<ResumeToken>,
    ) -> StreamerResult<Self::Feed>;
}

struct Watch<O: FeedOpener> {
    opener: Arc<O>,
    mode: WatchMode,
    feed: O::Feed,
}

/// Source fed by one or more change-feed watches
pub struct ChangeStreamSource<O: FeedOpener> {
    name: String,
    retry: RetryPolicy,
    reporter: FailureReporter,
    pending: Mutex<Vec<Watch<O>>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl<O: FeedOpener> ChangeStreamSource<O> {
    pub fn new<S: Into<String>>(name: S, retry: RetryPolicy, reporter: FailureReporter) -> Self {
        Self {
            name: name.into(),
            retry,
            reporter,
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Open a cursor through `opener` and record it for `start`
    pub async fn register(&self, opener: O, mode: WatchMode) -> StreamerResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(StreamerError::source(
                &self.name,
                "cannot add a watch after the source was started",
            ));
        }

        let collection = opener.collection().to_string();
        let feed = opener.open(mode, None).await.map_err(|e| {
            StreamerError::source(
                &self.name,
                format!("failed to watch collection '{}': {}", collection, e),
            )
        })?;

        info!(
            source = %self.name,
            collection = %collection,
            mode = %mode,
            "Registered watch"
        );
        self.pending.lock().await.push(Watch {
            opener: Arc::new(opener),
            mode,
            feed,
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn watch_count(&self) -> usize {
        self.pending.lock().await.len() + self.tasks.lock().await.len()
    }
}

#[async_trait]
impl<O: FeedOpener> EventSource for ChangeStreamSource<O> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, emitter: EventEmitter) -> StreamerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamerError::source(&self.name, "source already started"));
        }

        let watches: Vec<Watch<O>> = self.pending.lock().await.drain(..).collect();
        if watches.is_empty() {
            warn!(source = %self.name, "Source started without any watches");
        }

        let mut tasks = self.tasks.lock().await;
        for watch in watches {
            let task = WatchTask {
                source: self.name.clone(),
                collection: watch.opener.collection().to_string(),
                opener: watch.opener,
                mode: watch.mode,
                feed: watch.feed,
                emitter: emitter.clone(),
                retry: self.retry.clone(),
                reporter: self.reporter.clone(),
                cancel: self.cancel.child_token(),
            };
            tasks.spawn(task.run());
        }

        info!(source = %self.name, watches = tasks.len(), "Source started");
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(source = %self.name, "Watch task failed: {}", e);
            }
        }
        debug!(source = %self.name, "All watch tasks stopped");
    }
}

enum Reopen {
    Resumed,
    Cancelled,
    Exhausted(String),
}

struct WatchTask<O: FeedOpener> {
    source: String,
    collection: String,
    opener: Arc<O>,
    mode: WatchMode,
    feed: O::Feed,
    emitter: EventEmitter,
    retry: RetryPolicy,
    reporter: FailureReporter,
    cancel: CancellationToken,
}

impl<O: FeedOpener> WatchTask<O> {
    async fn run(mut self) {
        debug!(source = %self.source, collection = %self.collection, "Watch task running");
        let mut attempt = 0;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.feed.next_change() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    attempt = 0;
                    let event = match Event::from_raw(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            self.report(FailureKind::Decode(e.to_string()));
                            continue;
                        }
                    };
                    if !self.mode.matches(&event) {
                        debug!(
                            source = %self.source,
                            collection = %self.collection,
                            "Skipping {:?} notification",
                            event.operation_type()
                        );
                        continue;
                    }

                    let emitted = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        emitted = self.emitter.emit(event) => emitted,
                    };
                    match emitted {
                        Ok(()) => {}
                        Err(EmitError::Dropped) => {
                            warn!(
                                source = %self.source,
                                collection = %self.collection,
                                "Staging buffer full, event dropped"
                            );
                        }
                        Err(EmitError::Closed) => {
                            info!(
                                source = %self.source,
                                collection = %self.collection,
                                "Staging buffer closed, stopping watch"
                            );
                            break;
                        }
                    }
                }
                Some(Err(e)) => match self.reopen(&mut attempt, e).await {
                    Reopen::Resumed => continue,
                    Reopen::Cancelled => break,
                    Reopen::Exhausted(reason) => {
                        self.report(FailureKind::Terminated(reason));
                        return;
                    }
                },
                None => {
                    self.report(FailureKind::Terminated(
                        "change stream closed by server".to_string(),
                    ));
                    return;
                }
            }
        }

        debug!(source = %self.source, collection = %self.collection, "Watch task stopped");
    }

    async fn reopen(&mut self, attempt: &mut u32, cause: StreamerError) -> Reopen {
        let resume_after = self.feed.resume_token();
        let mut last_error = cause.to_string();

        loop {
            if !self.retry.should_retry(*attempt) {
                return Reopen::Exhausted(format!(
                    "cursor failed after {} retries: {}",
                    *attempt, last_error
                ));
            }

            let delay = self.retry.delay_for_attempt(*attempt);
            *attempt += 1;
            warn!(
                source = %self.source,
                collection = %self.collection,
                "Change stream error: {}, reopening in {:?} (attempt {}/{})",
                last_error,
                delay,
                *attempt,
                self.retry.max_retries
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Reopen::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Reopen::Cancelled,
                opened = self.opener.open(self.mode, resume_after.clone()) => opened,
            };
            match opened {
                Ok(feed) => {
                    info!(source = %self.source, collection = %self.collection, "Change stream reopened");
                    self.feed = feed;
                    return Reopen::Resumed;
                }
                Err(e) => last_error = e.to_string(),
            }
        }
    }

    fn report(&self, kind: FailureKind) {
        self.reporter.report(SourceFailure {
            source: self.source.clone(),
            collection: self.collection.clone(),
            kind,
        });
    }
}
