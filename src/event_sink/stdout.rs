//! Standard output event sink for testing and debugging

use async_trait::async_trait;
use std::io::{self, Write};
use std::sync::Mutex;
use tracing::debug;

use super::EventSink;
use crate::core::errors::{StreamerError, StreamerResult};
use crate::event::Event;

/// Writes each event as JSON, one whole record per write
pub struct StdoutSink {
    name: String,
    pretty: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    /// Create a new stdout sink
    pub fn new<S: Into<String>>(name: S, pretty: bool) -> Self {
        Self::with_writer(name, pretty, io::stdout())
    }

    /// Create a sink writing to an arbitrary writer
    pub fn with_writer<S, W>(name: S, pretty: bool, writer: W) -> Self
    where
        S: Into<String>,
        W: Write + Send + 'static,
    {
        Self {
            name: name.into(),
            pretty,
            out: Mutex::new(Box::new(writer)),
        }
    }

    fn render(&self, event: &Event) -> StreamerResult<String> {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(event)?
        } else {
            serde_json::to_string(event)?
        };
        Ok(rendered)
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_event(&self, event: &Event) -> StreamerResult<()> {
        let rendered = self.render(event)?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| StreamerError::sink(&self.name, "output lock poisoned"))?;
        writeln!(out, "{}", rendered)?;
        out.flush()?;

        debug!(sink = %self.name, bytes = rendered.len(), "Wrote event");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{Fields, Value};
    use std::sync::Arc;

    /// Writer whose contents stay inspectable after being moved into a sink
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn event(n: i64) -> Event {
        Event::new(Fields::from_iter([
            ("operationType", Value::String("insert".to_string())),
            ("n", Value::Int(n)),
        ]))
    }

    #[tokio::test]
    async fn test_stdout_sink_compact_lines() {
        let buffer = SharedBuffer::default();
        let sink = StdoutSink::with_writer("console", false, buffer.clone());

        sink.send_event(&event(1)).await.unwrap();
        sink.send_event(&event(2)).await.unwrap();

        assert_eq!(sink.name(), "console");
        assert_eq!(
            buffer.contents(),
            "{\"operationType\":\"insert\",\"n\":1}\n{\"operationType\":\"insert\",\"n\":2}\n"
        );
    }

    #[tokio::test]
    async fn test_stdout_sink_pretty() {
        let buffer = SharedBuffer::default();
        let sink = StdoutSink::with_writer("console", true, buffer.clone());

        sink.send_event(&event(7)).await.unwrap();

        assert_eq!(
            buffer.contents(),
            "{\n  \"operationType\": \"insert\",\n  \"n\": 7\n}\n"
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let buffer = SharedBuffer::default();
        let sink = Arc::new(StdoutSink::with_writer("console", false, buffer.clone()));

        let mut handles = Vec::new();
        for n in 0..32 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move { sink.send_event(&event(n)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let contents = buffer.contents();
        let mut seen: Vec<i64> = contents
            .lines()
            .map(|line| {
                let json: serde_json::Value = serde_json::from_str(line).unwrap();
                json["n"].as_i64().unwrap()
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }
}
