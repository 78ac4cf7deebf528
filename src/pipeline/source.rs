//! Message source abstraction for channel ingestion.
//!
//! Every source yields [`ChannelMessage`] envelopes, one JSON object per
//! line: `{"topic": "weather", "payload": {...}}`. Lines that are not a
//! valid envelope are logged and skipped; payload validation happens later
//! in the coordinator.

use crate::types::ChannelMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Events produced by a message source.
#[derive(Debug)]
pub enum SourceEvent {
    /// A message read from one of the input channels.
    Message(ChannelMessage),
    /// No more data (EOF for files/stdin, exhausted vector).
    Eof,
}

/// Trait abstracting where channel messages come from.
///
/// The processing loop calls [`next_message`](MessageSource::next_message)
/// inside a `select!` with cancellation, so implementations must be
/// cancel-safe at await points.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Read the next message. Returns `SourceEvent::Eof` when exhausted and
    /// `Err` only on unrecoverable I/O failure.
    async fn next_message(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging (e.g. "stdin", "replay").
    fn source_name(&self) -> &str;
}

/// JSON-lines envelope reader shared by the file and stdin sources.
///
/// Built on [`Lines`], whose `next_line()` keeps a partially read line in
/// its own buffer when the future is dropped, so losing a `select!` race
/// never loses input.
struct EnvelopeReader<R> {
    lines: Lines<R>,
    line_no: u64,
    source: &'static str,
}

impl<R: AsyncBufRead + Unpin> EnvelopeReader<R> {
    fn new(reader: R, source: &'static str) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            source,
        }
    }

    /// Read lines until one parses as an envelope.
    async fn next_envelope(&mut self) -> Result<SourceEvent> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChannelMessage>(line) {
                Ok(message) => return Ok(SourceEvent::Message(message)),
                Err(e) => {
                    tracing::warn!("[{}] Skipping line {}: {}", self.source, self.line_no, e);
                }
            }
        }
        Ok(SourceEvent::Eof)
    }
}

// ============================================================================
// Vec Source (in-memory)
// ============================================================================

/// Yields pre-built messages in order. Used by tests and embedding callers.
pub struct VecSource {
    messages: std::vec::IntoIter<ChannelMessage>,
}

impl VecSource {
    pub fn new(messages: Vec<ChannelMessage>) -> Self {
        Self {
            messages: messages.into_iter(),
        }
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        Ok(self.messages.next().map_or(SourceEvent::Eof, SourceEvent::Message))
    }

    fn source_name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Replay Source (JSON lines file)
// ============================================================================

/// Replays a recorded JSON-lines file with optional inter-message delay.
pub struct ReplaySource {
    reader: EnvelopeReader<BufReader<tokio::fs::File>>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub async fn open(path: &Path, delay_ms: u64) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        Ok(Self {
            reader: EnvelopeReader::new(BufReader::new(file), "ReplaySource"),
            delay_ms,
            yielded_first: false,
        })
    }
}

#[async_trait]
impl MessageSource for ReplaySource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        // No delay before the first message
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        let event = self.reader.next_envelope().await?;
        self.yielded_first = true;
        Ok(event)
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Stdin Source
// ============================================================================

/// Reads envelopes from stdin, e.g. `producer | agristream --stdin`.
pub struct StdinSource {
    reader: EnvelopeReader<BufReader<tokio::io::Stdin>>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: EnvelopeReader::new(BufReader::new(tokio::io::stdin()), "StdinSource"),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for StdinSource {
    async fn next_message(&mut self) -> Result<SourceEvent> {
        self.reader.next_envelope().await
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_replay_skips_invalid_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"topic":"weather","payload":{{"station":"S1"}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"payload":{{}}}}"#).unwrap();
        writeln!(file, r#"{{"topic":"yield","payload":{{}}}}"#).unwrap();
        file.flush().unwrap();

        let mut source = ReplaySource::open(file.path(), 0).await.unwrap();
        let mut topics = Vec::new();
        while let SourceEvent::Message(m) = source.next_message().await.unwrap() {
            topics.push(m.topic);
        }
        assert_eq!(topics, vec!["weather", "yield"]);
    }

    #[tokio::test]
    async fn test_interrupted_read_keeps_partial_line() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut envelopes = EnvelopeReader::new(BufReader::new(reader), "duplex");

        writer.write_all(br#"{"topic":"weather","pay"#).await.unwrap();
        tokio::select! {
            _ = envelopes.next_envelope() => panic!("half a line must not yield an event"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        writer.write_all(br#"load":{"station":"S1"}}"#).await.unwrap();
        writer.write_all(b"\n{\"topic\":\"yield\",\"payload\":{}}\n").await.unwrap();
        drop(writer);

        let mut topics = Vec::new();
        while let SourceEvent::Message(m) = envelopes.next_envelope().await.unwrap() {
            topics.push(m.topic);
        }
        assert_eq!(topics, vec!["weather", "yield"]);
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_error() {
        assert!(ReplaySource::open(Path::new("/nonexistent/replay.jsonl"), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_vec_source_ends_with_eof() {
        let mut source = VecSource::new(vec![ChannelMessage::new("metrics", serde_json::json!({}))]);
        assert!(matches!(source.next_message().await.unwrap(), SourceEvent::Message(_)));
        assert!(matches!(source.next_message().await.unwrap(), SourceEvent::Eof));
        assert!(matches!(source.next_message().await.unwrap(), SourceEvent::Eof));
    }
}
