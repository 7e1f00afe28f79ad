//! Wiring of named sources and sinks
//!
//! The engine builds every source and sink declared in the configuration, registers them
//! by name, resolves all connections up front and only then establishes the pipelines.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::connector::{self, Pipeline, PipelineSettings};
use crate::core::config::{ConnectionConfig, StreamerConfig};
use crate::core::errors::{StreamerError, StreamerResult};
use crate::event_sink::{EventSink, StdoutSink, WebhookSink, WebhookSinkConfig};
use crate::source::{EventSource, FailureReporter, MongoSource};

/// Named sources and sinks available for connections
#[derive(Default)]
pub struct Registry {
    sources: HashMap<String, Arc<dyn EventSource>>,
    sinks: HashMap<String, Arc<dyn EventSink>>,
}

/// A connection whose names were found in the registry
pub struct ResolvedConnection {
    pub name: String,
    pub source: Arc<dyn EventSource>,
    pub sink: Arc<dyn EventSink>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own name
    pub fn register_source(&mut self, source: Arc<dyn EventSource>) -> StreamerResult<()> {
        let name = source.name().to_string();
        if self.sources.contains_key(&name) {
            return Err(StreamerError::config(format!("duplicate source name \"{}\"", name)));
        }
        info!("Registering source: {}", name);
        self.sources.insert(name, source);
        Ok(())
    }

    /// Register a sink under its own name
    pub fn register_sink(&mut self, sink: Arc<dyn EventSink>) -> StreamerResult<()> {
        let name = sink.name().to_string();
        if self.sinks.contains_key(&name) {
            return Err(StreamerError::config(format!("duplicate sink name \"{}\"", name)));
        }
        info!("Registering sink: {}", name);
        self.sinks.insert(name, sink);
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&Arc<dyn EventSource>> {
        self.sources.get(name)
    }

    pub fn sink(&self, name: &str) -> Option<&Arc<dyn EventSink>> {
        self.sinks.get(name)
    }

    /// Look up every connection; fails on the first unknown name
    pub fn resolve(&self, connections: &[ConnectionConfig]) -> StreamerResult<Vec<ResolvedConnection>> {
        connections
            .iter()
            .map(|connection| {
                let source = self.source(&connection.source).ok_or_else(|| {
                    StreamerError::config(format!("no such source \"{}\"", connection.source))
                })?;
                let sink = self.sink(&connection.sink).ok_or_else(|| {
                    StreamerError::config(format!("no such sink \"{}\"", connection.sink))
                })?;
                Ok(ResolvedConnection {
                    name: connection.name.clone(),
                    source: source.clone(),
                    sink: sink.clone(),
                })
            })
            .collect()
    }

    /// Build every source and sink of `config`, connecting to MongoDB as needed
    pub async fn from_config(
        config: &StreamerConfig,
        reporter: FailureReporter,
    ) -> StreamerResult<Self> {
        let mut registry = Self::new();

        for source_config in &config.mongo_sources {
            info!("Starting source: {}", source_config.name);
            let db = MongoSource::connect(&source_config.uri, &source_config.database).await?;
            let source = MongoSource::new(
                source_config.name.clone(),
                db,
                config.retry.clone(),
                reporter.clone(),
            );
            for (collection, mode) in source_config.watch_list() {
                source.watch(&collection, mode).await?;
            }
            registry.register_source(Arc::new(source))?;
        }

        for sink_config in &config.stdout_sinks {
            info!("Starting sink: {}", sink_config.name);
            registry.register_sink(Arc::new(StdoutSink::new(
                sink_config.name.clone(),
                sink_config.pretty,
            )))?;
        }

        for sink_config in &config.webhook_sinks {
            info!("Starting sink: {}", sink_config.name);
            let sink = WebhookSink::new(
                sink_config.name.clone(),
                WebhookSinkConfig {
                    method: sink_config.method.clone(),
                    url: sink_config.url.clone(),
                },
            )?;
            registry.register_sink(Arc::new(sink))?;
        }

        Ok(registry)
    }
}

/// All running pipelines
pub struct Engine {
    pipelines: Vec<(String, Pipeline)>,
}

impl Engine {
    /// Resolve every connection, then establish the pipelines in declaration order.
    ///
    /// If any pipeline fails to start, those already running are shut down again.
    pub async fn start(
        registry: &Registry,
        connections: &[ConnectionConfig],
        settings: &PipelineSettings,
    ) -> StreamerResult<Self> {
        let resolved = registry.resolve(connections)?;
        let mut engine = Self {
            pipelines: Vec::with_capacity(resolved.len()),
        };

        for connection in resolved {
            info!("Starting connection: {}", connection.name);
            match connector::connect(connection.source, connection.sink, settings).await {
                Ok(pipeline) => engine.pipelines.push((connection.name, pipeline)),
                Err(e) => {
                    error!("Failed to start connection {}: {}", connection.name, e);
                    engine.shutdown().await;
                    return Err(e);
                }
            }
        }

        Ok(engine)
    }

    pub fn connection_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pipeline)| pipeline)
    }

    /// Shut every pipeline down, in reverse start order
    pub async fn shutdown(self) {
        for (name, pipeline) in self.pipelines.into_iter().rev() {
            if let Err(e) = pipeline.shutdown().await {
                error!("Connection {} did not shut down cleanly: {}", name, e);
            }
        }
    }
}
