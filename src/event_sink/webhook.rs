//! Webhook event sink
//!
//! Posts every event as a JSON document to a configured URL. Any transport failure,
//! timeout or non-2xx status is a delivery failure; retries are not attempted here.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Url};
use std::time::Duration;
use tracing::debug;

use super::EventSink;
use crate::core::errors::{StreamerError, StreamerResult};
use crate::event::Event;

/// Upper bound for a single delivery, connect to last body byte
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Webhook event sink configuration
#[derive(Debug, Clone)]
pub struct WebhookSinkConfig {
    /// HTTP method, POST when empty
    pub method: String,
    /// URL of the HTTP endpoint to send events to
    pub url: String,
}

/// HTTP event sink for sending events to an external endpoint
pub struct WebhookSink {
    name: String,
    method: Method,
    url: Url,
    http_client: Client,
}

impl WebhookSink {
    /// Create a new webhook sink, validating method and URL up front
    pub fn new<S: Into<String>>(name: S, config: WebhookSinkConfig) -> StreamerResult<Self> {
        Self::with_timeout(name, config, REQUEST_TIMEOUT)
    }

    pub fn with_timeout<S: Into<String>>(
        name: S,
        config: WebhookSinkConfig,
        timeout: Duration,
    ) -> StreamerResult<Self> {
        let name = name.into();
        let method = parse_method(&config.method)
            .ok_or_else(|| StreamerError::config(format!("invalid HTTP method '{}'", config.method)))?;

        let url = Url::parse(&config.url)
            .map_err(|e| StreamerError::config(format!("invalid webhook URL '{}': {}", config.url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(StreamerError::config(format!(
                "webhook URL '{}' must start with http:// or https://",
                config.url
            )));
        }

        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name,
            method,
            url,
            http_client,
        })
    }
}

pub(crate) fn parse_method(method: &str) -> Option<Method> {
    let method = method.trim();
    if method.is_empty() {
        return Some(Method::POST);
    }
    Method::from_bytes(method.to_ascii_uppercase().as_bytes()).ok()
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_event(&self, event: &Event) -> StreamerResult<()> {
        let body = serde_json::to_vec(event).map_err(|e| {
            StreamerError::sink(&self.name, format!("failed to serialize event: {}", e))
        })?;

        let request = self
            .http_client
            .request(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(|e| StreamerError::sink(&self.name, format!("failed to build request: {}", e)))?;

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| StreamerError::sink(&self.name, format!("HTTP request failed: {}", e)))?;

        // dropping the response releases the connection without reading the body
        let status = response.status();
        drop(response);

        if status.is_success() {
            debug!(sink = %self.name, %status, "Delivered event to webhook");
            Ok(())
        } else {
            Err(StreamerError::sink(
                &self.name,
                format!("HTTP endpoint returned status: {}", status),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Fields, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;

    fn event() -> Event {
        Event::new(Fields::from_iter([
            ("operationType", Value::String("insert".to_string())),
            ("n", Value::Int(1)),
        ]))
    }

    fn config(url: &str) -> WebhookSinkConfig {
        WebhookSinkConfig {
            method: "post".to_string(),
            url: url.to_string(),
        }
    }

    /// Minimal HTTP endpoint answering every request with `status`, forwarding request bodies
    async fn endpoint(status: &'static str) -> (String, mpsc::UnboundedReceiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let (head, body) = loop {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        if let Some(end) = text.find("\r\n\r\n") {
                            let head = text[..end].to_string();
                            let length = head
                                .lines()
                                .find_map(|l| {
                                    let (k, v) = l.split_once(':')?;
                                    k.eq_ignore_ascii_case("content-length")
                                        .then(|| v.trim().parse::<usize>().ok())
                                        .flatten()
                                })
                                .unwrap_or(0);
                            if buf.len() >= end + 4 + length {
                                let body = text[end + 4..end + 4 + length].to_string();
                                break (head, body);
                            }
                        }
                    };
                    let _ = tx.send((head, body));
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/hook", addr), rx)
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(parse_method(""), Some(Method::POST));
        assert_eq!(parse_method("put"), Some(Method::PUT));
        assert_eq!(parse_method("not a method"), None);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(WebhookSink::new("hook", config("ftp://example.com")).is_err());
        assert!(WebhookSink::new("hook", config("not a url")).is_err());

        let bad_method = WebhookSinkConfig {
            method: "GE T".to_string(),
            url: "http://example.com".to_string(),
        };
        let err = WebhookSink::new("hook", bad_method).err().unwrap();
        assert!(matches!(err, StreamerError::Configuration { .. }));

        let sink = WebhookSink::new("hook", config("https://example.com/events")).unwrap();
        assert_eq!(sink.method, Method::POST);
        assert_eq!(sink.url.as_str(), "https://example.com/events");
    }

    #[tokio::test]
    async fn test_posts_event_as_json() {
        let (url, mut requests) = endpoint("200 OK").await;
        let sink = WebhookSink::new("hook", config(&url)).unwrap();

        sink.send_event(&event()).await.unwrap();

        let (head, body) = requests.recv().await.unwrap();
        assert!(head.starts_with("POST /hook HTTP/1.1"));
        assert!(head.to_lowercase().contains("content-type: application/json"));
        assert_eq!(body, r#"{"operationType":"insert","n":1}"#);
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_failure() {
        let (url, _requests) = endpoint("500 Internal Server Error").await;
        let sink = WebhookSink::new("hook", config(&url)).unwrap();

        let err = sink.send_event(&event()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_failure() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = WebhookSink::with_timeout(
            "hook",
            config(&format!("http://{}/hook", addr)),
            Duration::from_secs(2),
        )
        .unwrap();

        for _ in 0..3 {
            let err = sink.send_event(&event()).await.unwrap_err();
            assert!(matches!(err, StreamerError::Sink { .. }));
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_bodies_apart() {
        let (url, mut requests) = endpoint("204 No Content").await;
        let sink = Arc::new(WebhookSink::new("hook", config(&url)).unwrap());

        let mut sends = JoinSet::new();
        for n in 0..20 {
            let sink = sink.clone();
            sends.spawn(async move {
                let event = Event::new(Fields::from_iter([("n", Value::Int(n))]));
                sink.send_event(&event).await
            });
        }
        while let Some(result) = sends.join_next().await {
            result.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let (_, body) = requests.recv().await.unwrap();
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            let fields = json.as_object().unwrap();
            assert_eq!(fields.len(), 1, "unexpected body {}", body);
            seen.push(fields["n"].as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}
