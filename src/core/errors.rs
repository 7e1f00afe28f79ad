//! Error types for the change-data-capture connector
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

/// Main error type for the connector
#[derive(Error, Debug)]
pub enum StreamerError {
    /// Configuration and wiring errors, always fatal at startup
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Connectivity errors towards an upstream or downstream system
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A change notification could not be decoded into an event
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Source lifecycle errors
    #[error("Source '{source_name}' error: {message}")]
    Source { message: String, source_name: String },

    /// Delivery failures reported by a sink
    #[error("Sink '{sink}' error: {message}")]
    Sink { message: String, sink: String },

    #[error("MongoDB error")]
    Mongo(#[from] mongodb::error::Error),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// Network/IO related errors
    #[error("Network IO error")]
    NetworkIO(#[from] std::io::Error),

    /// Task execution errors for async operations
    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type StreamerResult<T> = std::result::Result<T, StreamerError>;

impl StreamerError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with its underlying cause
    pub fn connection<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a source error
    pub fn source<N: Into<String>, S: Into<String>>(source_name: N, message: S) -> Self {
        Self::Source {
            message: message.into(),
            source_name: source_name.into(),
        }
    }

    /// Create a sink error
    pub fn sink<N: Into<String>, S: Into<String>>(sink: N, message: S) -> Self {
        Self::Sink {
            message: message.into(),
            sink: sink.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_names() {
        let err = StreamerError::sink("hooks", "HTTP endpoint returned status 500");
        assert_eq!(
            err.to_string(),
            "Sink 'hooks' error: HTTP endpoint returned status 500"
        );

        let err = StreamerError::source("orders", "already started");
        assert_eq!(err.to_string(), "Source 'orders' error: already started");
    }
}
