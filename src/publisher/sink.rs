//! Output sinks for serialized records.
//!
//! A sink is the downstream half of the output channel. Writes are buffered
//! and not committed until [`RecordSink::flush`]; the publisher never waits
//! for durability.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::PublishError;

/// Trait abstracting where serialized records go.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Hand one serialized record to the channel.
    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Push buffered writes through. Called on shutdown.
    async fn flush(&mut self) -> Result<(), PublishError>;

    /// Human-readable name for logging (e.g. "stdout", "channel").
    fn sink_name(&self) -> &str;
}

// ============================================================================
// JSON Lines Sink
// ============================================================================

/// Writes `{"topic": ..., "payload": ...}` lines, the same envelope the
/// input sources read.
pub struct JsonLinesSink<W: AsyncWrite + Unpin + Send + 'static> {
    writer: BufWriter<W>,
    name: String,
}

impl<W: AsyncWrite + Unpin + Send + 'static> JsonLinesSink<W> {
    pub fn new(writer: W, name: impl Into<String>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            name: name.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout(), "stdout")
    }
}

impl JsonLinesSink<tokio::fs::File> {
    /// Append to `path`, creating it if needed.
    pub async fn append_file(path: &Path) -> Result<Self, PublishError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| PublishError::Transport(format!("{}: {e}", path.display())))?;
        Ok(Self::new(file, path.display().to_string()))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync + 'static> RecordSink for JsonLinesSink<W> {
    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let topic_json =
            serde_json::to_vec(topic).map_err(|e| PublishError::Serialization(e.to_string()))?;
        let mut line = Vec::with_capacity(payload.len() + topic_json.len() + 24);
        line.extend_from_slice(b"{\"topic\":");
        line.extend_from_slice(&topic_json);
        line.extend_from_slice(b",\"payload\":");
        line.extend_from_slice(payload);
        line.extend_from_slice(b"}\n");
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), PublishError> {
        self.writer
            .flush()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    fn sink_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Channel Sink
// ============================================================================

/// A record as delivered through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// In-process bounded channel; used by tests and embedding callers.
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.tx
            .send(OutboundRecord {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| PublishError::Transport("output channel closed".to_string()))
    }

    async fn flush(&mut self) -> Result<(), PublishError> {
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_lines_sink_writes_envelope() {
        let mut sink = JsonLinesSink::new(Vec::<u8>::new(), "buffer");
        sink.send("enriched_yield", br#"{"region":"IOWA"}"#).await.unwrap();
        sink.flush().await.unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "{\"topic\":\"enriched_yield\",\"payload\":{\"region\":\"IOWA\"}}\n");
        let parsed: crate::types::ChannelMessage = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed.payload["region"], "IOWA");
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (mut sink, rx) = ChannelSink::new(1);
        drop(rx);
        let err = sink.send("out", b"{}").await.unwrap_err();
        assert!(matches!(err, PublishError::Transport(_)));
    }
}
