use async_stream::stream;
use futures::{Stream, StreamExt};
use reqwest::Response;
use std::fmt::{self, Display, Formatter};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

const EVENT_DELIMITER: &[u8] = b"\n\n";
const FIELD_SEPARATOR: char = ':';

/// Stream of framed SSE events as delivered by the transport.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, EventError>> + Send>>;

/// Possible errors that can occur while reading SSE events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("invalid event format: event contains no data")]
    InvalidFormat,
    #[error("transport failed: {0}")]
    Transport(String),
}

/// Represents a Server-Sent Event (SSE) with its associated fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Unique identifier for the event
    pub id: Option<String>,
    /// Type of the event (defaults to "message" in SSE spec)
    pub event_type: Option<String>,
    /// The event payload
    pub data: String,
    /// Reconnection time in case of connection failure
    pub retry: Option<Duration>,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ event_type: {:?}, data: {} }}",
            self.event_type, self.data
        )
    }
}

impl Event {
    /// Builds a named event, mostly useful for feeding fake sources.
    pub fn named(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    /// The event name, or `"message"` when the block had no `event:` field.
    pub fn kind(&self) -> &str {
        self.event_type.as_deref().unwrap_or("message")
    }

    /// Parses an SSE event from a single event block.
    ///
    /// Comment lines, unknown fields and a malformed `retry` value are
    /// skipped. Returns `Err(EventError::InvalidFormat)` when the block
    /// carries no `data` line.
    pub fn parse(input: &str) -> Result<Self, EventError> {
        let mut event = Self::default();
        let mut data_lines = Vec::new();

        for line in input.lines() {
            if line.is_empty() || line.starts_with(FIELD_SEPARATOR) {
                continue;
            }

            let (field, value) = line.split_once(FIELD_SEPARATOR).unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "id" => event.id = Some(value.to_string()),
                "event" => event.event_type = Some(value.to_string()),
                "data" => data_lines.push(value),
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        event.retry = Some(Duration::from_millis(ms));
                    }
                }
                _ => {}
            }
        }

        if data_lines.is_empty() {
            return Err(EventError::InvalidFormat);
        }

        event.data = data_lines.join("\n");
        Ok(event)
    }
}

/// Frames a chunked byte stream into SSE events.
///
/// Chunks may split events, lines and UTF-8 sequences anywhere. Blocks
/// without data (keep-alive comments, bare `retry:` lines) are skipped.
pub fn sse_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::with_capacity(1024);
        // Bytes before this offset are known not to start a delimiter.
        let mut scanned = 0;

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(EventError::Transport(e.to_string()));
                    return;
                }
            };
            buffer.extend(chunk.as_ref().iter().filter(|&&b| b != b'\r'));

            while let Some(event_end) = find_delimiter(&buffer, scanned) {
                let block: Vec<u8> = buffer.drain(..event_end + EVENT_DELIMITER.len()).collect();
                scanned = 0;
                if let Ok(event) = Event::parse(&String::from_utf8_lossy(&block)) {
                    yield Ok(event);
                }
            }
            scanned = buffer.len().saturating_sub(EVENT_DELIMITER.len() - 1);
        }

        if !buffer.is_empty() {
            if let Ok(event) = Event::parse(&String::from_utf8_lossy(&buffer)) {
                yield Ok(event);
            }
        }
    })
}

fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(EVENT_DELIMITER.len())
        .position(|window| window == EVENT_DELIMITER)
        .map(|position| from + position)
}

/// Extension trait for converting a Response into a Stream of SSE Events.
pub trait EventSourceExt {
    fn events(self) -> EventStream;
}

impl EventSourceExt for Response {
    fn events(self) -> EventStream {
        sse_events(self.bytes_stream())
    }
}
