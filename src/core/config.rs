//! Configuration management for the connector
//!
//! The configuration is a single JSON document naming every source, every sink and the
//! connections between them. Keys are PascalCase. Validation happens here, before any
//! source connects, so that wiring mistakes are reported as configuration errors.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::errors::{StreamerError, StreamerResult};
use super::retry::RetryPolicy;
use crate::connector::PipelineSettings;
use crate::source::WatchMode;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamerConfig {
    #[serde(default)]
    pub mongo_sources: Vec<MongoSourceConfig>,
    #[serde(default, rename = "StdOutSinks", alias = "StdoutSinks")]
    pub stdout_sinks: Vec<StdoutSinkConfig>,
    #[serde(default)]
    pub webhook_sinks: Vec<WebhookSinkEntry>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// A MongoDB database whose collections are watched
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MongoSourceConfig {
    pub name: String,
    #[serde(rename = "URI", alias = "Uri")]
    pub uri: String,
    pub database: String,
    /// Single collection shorthand
    #[serde(default)]
    pub collection: Option<String>,
    /// Mode of the shorthand collection
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub watches: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatchConfig {
    pub collection: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StdoutSinkConfig {
    pub name: String,
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookSinkEntry {
    pub name: String,
    #[serde(default)]
    pub method: String,
    #[serde(rename = "URL", alias = "Url")]
    pub url: String,
}

/// Named pairing of one source with one sink
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionConfig {
    pub name: String,
    pub source: String,
    pub sink: String,
}

impl MongoSourceConfig {
    /// Every (collection, mode) pair this source watches, shorthand first
    pub fn watch_list(&self) -> Vec<(String, WatchMode)> {
        let resolve = |mode: &Option<String>| match mode {
            Some(name) => WatchMode::from_name(name),
            None => WatchMode::default(),
        };

        let mut list = Vec::new();
        if let Some(collection) = &self.collection {
            list.push((collection.clone(), resolve(&self.mode)));
        }
        for watch in &self.watches {
            list.push((watch.collection.clone(), resolve(&watch.mode)));
        }
        list
    }
}

impl StreamerConfig {
    /// Read, parse and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> StreamerResult<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let data = std::fs::read_to_string(path).map_err(|e| {
            StreamerError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }

    /// Parse and validate a configuration document
    pub fn from_json(data: &str) -> StreamerResult<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| StreamerError::config(format!("invalid config document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check names, references and settings
    pub fn validate(&self) -> StreamerResult<()> {
        let mut sources = HashSet::new();
        for source in &self.mongo_sources {
            check_name("source", &source.name)?;
            if !sources.insert(source.name.as_str()) {
                return Err(StreamerError::config(format!(
                    "duplicate source name \"{}\"",
                    source.name
                )));
            }
            if source.uri.trim().is_empty() {
                return Err(StreamerError::config(format!(
                    "source \"{}\": URI cannot be empty",
                    source.name
                )));
            }
            if source.database.trim().is_empty() {
                return Err(StreamerError::config(format!(
                    "source \"{}\": Database cannot be empty",
                    source.name
                )));
            }
            if source.collection.is_none() && source.watches.is_empty() {
                return Err(StreamerError::config(format!(
                    "source \"{}\" does not watch any collection",
                    source.name
                )));
            }
            for (collection, _) in source.watch_list() {
                if collection.trim().is_empty() {
                    return Err(StreamerError::config(format!(
                        "source \"{}\": Collection cannot be empty",
                        source.name
                    )));
                }
            }
        }

        let mut sinks = HashSet::new();
        let sink_names = self
            .stdout_sinks
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.webhook_sinks.iter().map(|s| s.name.as_str()));
        for name in sink_names {
            check_name("sink", name)?;
            if !sinks.insert(name) {
                return Err(StreamerError::config(format!(
                    "duplicate sink name \"{}\"",
                    name
                )));
            }
        }

        for webhook in &self.webhook_sinks {
            if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
                return Err(StreamerError::config(format!(
                    "sink \"{}\": URL must start with http:// or https://",
                    webhook.name
                )));
            }
            if crate::event_sink::webhook::parse_method(&webhook.method).is_none() {
                return Err(StreamerError::config(format!(
                    "sink \"{}\": invalid HTTP method \"{}\"",
                    webhook.name, webhook.method
                )));
            }
        }

        let mut connected_sources = HashSet::new();
        for connection in &self.connections {
            check_name("connection", &connection.name)?;
            if !sources.contains(connection.source.as_str()) {
                return Err(StreamerError::config(format!(
                    "connection \"{}\": no such source \"{}\"",
                    connection.name, connection.source
                )));
            }
            if !sinks.contains(connection.sink.as_str()) {
                return Err(StreamerError::config(format!(
                    "connection \"{}\": no such sink \"{}\"",
                    connection.name, connection.sink
                )));
            }
            if !connected_sources.insert(connection.source.as_str()) {
                return Err(StreamerError::config(format!(
                    "connection \"{}\": source \"{}\" is already used by another connection",
                    connection.name, connection.source
                )));
            }
        }

        self.pipeline.validate()
    }
}

fn check_name(kind: &str, name: &str) -> StreamerResult<()> {
    if name.trim().is_empty() {
        return Err(StreamerError::config(format!("{} name cannot be empty", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::OverflowPolicy;

    const FULL: &str = r#"{
        "MongoSources": [
            {
                "Name": "orders",
                "URI": "mongodb://localhost:27017",
                "Database": "shop",
                "Mode": "insert-only",
                "Collection": "orders",
                "Watches": [{ "Collection": "refunds", "Mode": "all" }]
            }
        ],
        "StdOutSinks": [{ "Name": "console", "Pretty": true }],
        "WebhookSinks": [{ "Name": "hooks", "Method": "post", "URL": "https://example.com/hook" }],
        "Connections": [{ "Name": "orders-to-console", "Source": "orders", "Sink": "console" }],
        "Pipeline": { "Workers": 1, "Overflow": "drop-newest" },
        "Retry": { "MaxRetries": 2 }
    }"#;

    #[test]
    fn test_full_document() {
        let config = StreamerConfig::from_json(FULL).unwrap();

        let source = &config.mongo_sources[0];
        assert_eq!(source.uri, "mongodb://localhost:27017");
        assert_eq!(
            source.watch_list(),
            vec![
                ("orders".to_string(), WatchMode::InsertOnly),
                ("refunds".to_string(), WatchMode::All),
            ]
        );
        assert!(config.stdout_sinks[0].pretty);
        assert_eq!(config.webhook_sinks[0].url, "https://example.com/hook");
        assert_eq!(config.connections[0].sink, "console");

        assert_eq!(config.pipeline.workers, 1);
        assert_eq!(config.pipeline.buffer_capacity, 5);
        assert_eq!(config.pipeline.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
    }

    #[test]
    fn test_defaults_and_unknown_mode() {
        let config = StreamerConfig::from_json(
            r#"{
                "MongoSources": [{ "Name": "s", "URI": "mongodb://h", "Database": "d",
                                   "Collection": "c", "Mode": "upserts" }],
                "StdOutSinks": [{ "Name": "out" }],
                "Connections": [{ "Name": "c", "Source": "s", "Sink": "out" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.pipeline, PipelineSettings::default());
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(!config.stdout_sinks[0].pretty);
        assert_eq!(
            config.mongo_sources[0].watch_list(),
            vec![("c".to_string(), WatchMode::InsertOnly)]
        );
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let err = StreamerConfig::from_json(
            r#"{
                "StdOutSinks": [{ "Name": "out" }],
                "Connections": [{ "Name": "c", "Source": "missing", "Sink": "out" }]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no such source \"missing\""));

        let err = StreamerConfig::from_json(
            r#"{
                "MongoSources": [{ "Name": "s", "URI": "mongodb://h", "Database": "d", "Collection": "c" }],
                "Connections": [{ "Name": "c", "Source": "s", "Sink": "missing" }]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no such sink \"missing\""));
    }

    #[test]
    fn test_invalid_documents() {
        let cases = [
            // duplicate sink across kinds
            r#"{ "StdOutSinks": [{ "Name": "x" }],
                 "WebhookSinks": [{ "Name": "x", "URL": "http://h" }] }"#,
            // webhook scheme
            r#"{ "WebhookSinks": [{ "Name": "x", "URL": "ftp://h" }] }"#,
            // source without collections
            r#"{ "MongoSources": [{ "Name": "s", "URI": "mongodb://h", "Database": "d" }] }"#,
            // source shared by two connections
            r#"{ "MongoSources": [{ "Name": "s", "URI": "mongodb://h", "Database": "d", "Collection": "c" }],
                 "StdOutSinks": [{ "Name": "a" }, { "Name": "b" }],
                 "Connections": [{ "Name": "1", "Source": "s", "Sink": "a" },
                                 { "Name": "2", "Source": "s", "Sink": "b" }] }"#,
            // zero-sized buffer
            r#"{ "Pipeline": { "BufferCapacity": 0 } }"#,
            // not JSON at all
            "MongoSources:",
        ];

        for case in cases {
            let err = StreamerConfig::from_json(case).unwrap_err();
            assert!(
                matches!(err, StreamerError::Configuration { .. }),
                "unexpected error kind for {}: {}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_missing_file() {
        let err = StreamerConfig::from_file("/nonexistent/streamer.json").unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }
}
