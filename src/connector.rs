//! Routing pipeline between one source and one sink
//!
//! ```text
//! source watches --emit--> staging buffer (bounded) --router--> dispatch pool (N workers) --> sink
//! ```
//!
//! The router only waits for a free worker slot and for the next buffered event; sink I/O
//! happens on the worker tasks. A full buffer blocks the emitting watch under
//! [`OverflowPolicy::Block`], which stalls that watch's cursor read. Events delivered by
//! different workers may reach the sink in any order; use one worker for in-order delivery.

use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::errors::{StreamerError, StreamerResult};
use crate::event::Event;
use crate::event_sink::EventSink;
use crate::source::{EventEmitter, EventSource, OverflowPolicy};

/// Buffering, concurrency and shutdown settings of a pipeline
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineSettings {
    /// Capacity of the staging buffer
    pub buffer_capacity: usize,
    /// Number of concurrent `send_event` calls
    pub workers: usize,
    pub overflow: OverflowPolicy,
    /// How long shutdown waits for buffered and in-flight deliveries
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 5,
            workers: 5,
            overflow: OverflowPolicy::Block,
            shutdown_timeout_secs: 30,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> StreamerResult<()> {
        if self.buffer_capacity == 0 {
            return Err(StreamerError::config("BufferCapacity must be at least 1"));
        }
        if self.workers == 0 {
            return Err(StreamerError::config("Workers must be at least 1"));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Delivery counters of a running pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl PipelineStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliveries attempted so far, successful or not
    pub fn completed(&self) -> u64 {
        self.delivered() + self.failed()
    }
}

/// Handle to an established source → sink pipeline
pub struct Pipeline {
    source: Arc<dyn EventSource>,
    sink_name: String,
    shutdown_timeout: Duration,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    router: JoinHandle<()>,
}

/// Wire `source` to `sink`.
///
/// Returns once the pipeline is running; delivery happens in the background. A failing
/// `source.start` aborts setup and is returned unchanged.
pub async fn connect(
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EventSink>,
    settings: &PipelineSettings,
) -> StreamerResult<Pipeline> {
    settings.validate()?;

    let (tx, rx) = mpsc::channel(settings.buffer_capacity);
    source.start(EventEmitter::new(tx, settings.overflow)).await?;

    let stats = Arc::new(PipelineStats::default());
    let cancel = CancellationToken::new();
    let sink_name = sink.name().to_string();
    let router = Router {
        rx,
        sink,
        workers: Arc::new(Semaphore::new(settings.workers)),
        deliveries: JoinSet::new(),
        stats: stats.clone(),
        cancel: cancel.clone(),
        shutdown_timeout: settings.shutdown_timeout(),
    };

    info!(
        source = %source.name(),
        sink = %sink_name,
        buffer = settings.buffer_capacity,
        workers = settings.workers,
        "Pipeline established"
    );

    Ok(Pipeline {
        source,
        sink_name,
        shutdown_timeout: settings.shutdown_timeout(),
        stats,
        cancel,
        router: tokio::spawn(router.run()),
    })
}

impl Pipeline {
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Whether the router has exited, e.g. because every watch of the source ended
    pub fn is_finished(&self) -> bool {
        self.router.is_finished()
    }

    /// Stop the source, deliver what is still buffered and wait for in-flight deliveries.
    ///
    /// Stopping the source and draining the buffer are each bounded by the shutdown timeout.
    pub async fn shutdown(self) -> StreamerResult<()> {
        info!(source = %self.source.name(), sink = %self.sink_name, "Shutting down pipeline");
        if tokio::time::timeout(self.shutdown_timeout, self.source.shutdown())
            .await
            .is_err()
        {
            warn!(
                source = %self.source.name(),
                "Source did not stop within {:?}, continuing shutdown",
                self.shutdown_timeout
            );
        }
        self.cancel.cancel();
        self.router.await?;
        info!(
            source = %self.source.name(),
            sink = %self.sink_name,
            delivered = self.stats.delivered(),
            failed = self.stats.failed(),
            "Pipeline stopped"
        );
        Ok(())
    }
}

struct Router {
    rx: mpsc::Receiver<Event>,
    sink: Arc<dyn EventSink>,
    workers: Arc<Semaphore>,
    deliveries: JoinSet<()>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Router {
    async fn run(mut self) {
        let cancelled = loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break true,
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break false,
                },
            };
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break true,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break false,
                },
            };

            self.dispatch(permit, event);
            self.reap();
        };

        if cancelled {
            self.drain().await;
        } else {
            debug!(sink = %self.sink.name(), "Staging buffer closed, waiting for in-flight deliveries");
            while let Some(result) = self.deliveries.join_next().await {
                log_join_error(result);
            }
        }
    }

    fn dispatch(&mut self, permit: tokio::sync::OwnedSemaphorePermit, event: Event) {
        let sink = self.sink.clone();
        let stats = self.stats.clone();
        self.deliveries.spawn(async move {
            let _permit = permit;
            match sink.send_event(&event).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(sink = %sink.name(), "Failed to deliver event: {}", e);
                }
            }
        });
    }

    fn reap(&mut self) {
        while let Some(result) = self.deliveries.try_join_next() {
            log_join_error(result);
        }
    }

    /// Deliver the remaining buffered events, bounded by the shutdown timeout
    async fn drain(&mut self) {
        self.rx.close();
        let timeout = self.shutdown_timeout;

        let finished = tokio::time::timeout(timeout, async {
            while let Some(event) = self.rx.recv().await {
                let Ok(permit) = self.workers.clone().acquire_owned().await else {
                    break;
                };
                self.dispatch(permit, event);
            }
            while let Some(result) = self.deliveries.join_next().await {
                log_join_error(result);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                sink = %self.sink.name(),
                pending = self.deliveries.len(),
                "Deliveries still running after {:?}, aborting them",
                timeout
            );
            self.deliveries.shutdown().await;
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Delivery task panicked: {}", e);
        }
    }
}
