use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::stage::Stage;

const DATA_PREFIX: &str = "data: ";

/// One message on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub data: Value,
}

impl ProgressEvent {
    pub fn new(stage: Stage, data: Value) -> Self {
        Self {
            stage: stage.to_string(),
            data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Complete.as_str() || self.stage == Stage::Error.as_str()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event stream receiver went away")]
    Closed,
    #[error("event stream io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Ordered destination for progress events.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: &ProgressEvent) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Frames an event as a `data:` line followed by a blank line.
pub fn encode_event(event: &ProgressEvent) -> Result<String, SinkError> {
    Ok(format!("{DATA_PREFIX}{}\n\n", serde_json::to_string(event)?))
}

/// Reads back every event in a text event stream. Lines other than `data:`
/// lines are ignored; multi-line data is joined with newlines.
pub fn parse_event_stream(text: &str) -> Result<Vec<ProgressEvent>, serde_json::Error> {
    let mut events = Vec::new();
    for block in text.split("\n\n") {
        let payload: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if payload.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&payload.join("\n"))?);
    }
    Ok(events)
}

/// Forwards encoded frames into a bounded channel, e.g. an HTTP response body.
pub struct ChannelSink {
    sender: Option<mpsc::Sender<String>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: &ProgressEvent) -> Result<(), SinkError> {
        let sender = self.sender.as_ref().ok_or(SinkError::Closed)?;
        let frame = encode_event(event)?;
        sender.send(frame).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.sender.take();
        Ok(())
    }
}

/// Writes encoded frames to any async writer, flushing after each event.
pub struct WriterSink<W> {
    writer: W,
    closed: bool,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&mut self, event: &ProgressEvent) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let frame = encode_event(event)?;
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if !self.closed {
            self.closed = true;
            self.writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_data_prefix_and_blank_line() {
        let event = ProgressEvent::new(Stage::Ttfb, json!({"ttfb": "1.00"}));
        let frame = encode_event(&event).unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert_eq!(frame.matches('\n').count(), 2);
    }

    #[test]
    fn parses_what_it_encodes_and_skips_comments() {
        let first = ProgressEvent::new(Stage::TitleTime, json!({"title": "a\nb"}));
        let last = ProgressEvent::new(Stage::Complete, json!({"success": true}));
        let text = format!(
            ": keep-alive\n\n{}{}",
            encode_event(&first).unwrap(),
            encode_event(&last).unwrap()
        );
        let events = parse_event_stream(&text).unwrap();
        assert_eq!(events, vec![first, last.clone()]);
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut sink, receiver) = ChannelSink::channel(1);
        drop(receiver);
        let event = ProgressEvent::new(Stage::Ttfb, json!({}));
        assert!(matches!(sink.emit(&event).await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn writer_sink_rejects_emit_after_close() {
        let mut sink = WriterSink::new(Vec::new());
        let event = ProgressEvent::new(Stage::Ttfb, json!({"ttfb": "3.10"}));
        sink.emit(&event).await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(sink.emit(&event).await, Err(SinkError::Closed)));
        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(parse_event_stream(&written).unwrap(), vec![event]);
    }
}
