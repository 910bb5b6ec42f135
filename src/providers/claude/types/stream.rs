use super::{ApiErrorDetail, MessageResponse, StopReason};
use crate::core::error::DecodeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event types that change the assembled response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MessageStart,
    ContentBlockDelta,
    MessageDelta,
    MessageStop,
    Error,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::ContentBlockDelta => "content_block_delta",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Error => "error",
        }
    }
}

/// How a named SSE event is treated before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Meaningful(EventKind),
    /// Known event types with no effect on the response.
    Ignored,
    /// Event types this client does not know; dropped for forward compatibility.
    Unknown,
}

impl EventClass {
    pub fn classify(event_type: &str) -> Self {
        match event_type {
            "message_start" => Self::Meaningful(EventKind::MessageStart),
            "content_block_delta" => Self::Meaningful(EventKind::ContentBlockDelta),
            "message_delta" => Self::Meaningful(EventKind::MessageDelta),
            "message_stop" => Self::Meaningful(EventKind::MessageStop),
            "error" => Self::Meaningful(EventKind::Error),
            "ping" | "content_block_start" | "content_block_stop" => Self::Ignored,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageStartEvent {
    pub message: MessageResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentBlockDeltaEvent {
    pub index: usize,
    pub delta: TextDelta,
}

/// `text_delta` carries `text`; other delta kinds decode with empty text.
#[derive(Debug, Serialize, Deserialize)]
pub struct TextDelta {
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageDeltaEvent {
    pub delta: MessageDeltaBody,
    #[serde(default)]
    pub usage: DeltaUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeltaUsage {
    pub output_tokens: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: ApiErrorDetail,
}

/// One decoded unit of change carried by a stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    MessageStart {
        message: MessageResponse,
    },
    ContentBlockDelta {
        index: usize,
        text: String,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        stop_sequence: Option<String>,
        output_tokens: u64,
    },
    MessageStop,
    Error {
        error_type: String,
        message: String,
    },
}

impl Delta {
    /// Decodes the payload of a meaningful event.
    pub fn decode(kind: EventKind, data: &str) -> Result<Self, DecodeError> {
        let delta = match kind {
            EventKind::MessageStart => {
                let MessageStartEvent { message } = parse(kind, data)?;
                Self::MessageStart { message }
            }
            EventKind::ContentBlockDelta => {
                let ContentBlockDeltaEvent { index, delta } = parse(kind, data)?;
                Self::ContentBlockDelta {
                    index,
                    text: delta.text,
                }
            }
            EventKind::MessageDelta => {
                let MessageDeltaEvent { delta, usage } = parse(kind, data)?;
                Self::MessageDelta {
                    stop_reason: delta.stop_reason,
                    stop_sequence: delta.stop_sequence,
                    output_tokens: usage.output_tokens,
                }
            }
            EventKind::MessageStop => Self::MessageStop,
            EventKind::Error => {
                let ErrorEvent { error } = parse(kind, data)?;
                Self::Error {
                    error_type: error.error_type,
                    message: error.message,
                }
            }
        };
        Ok(delta)
    }
}

/// Decodes a named event. Ignored and unknown event types yield `Ok(None)`.
pub fn decode(event_type: &str, data: &str) -> Result<Option<Delta>, DecodeError> {
    match EventClass::classify(event_type) {
        EventClass::Meaningful(kind) => Delta::decode(kind, data).map(Some),
        EventClass::Ignored | EventClass::Unknown => Ok(None),
    }
}

fn parse<T: DeserializeOwned>(kind: EventKind, data: &str) -> Result<T, DecodeError> {
    serde_json::from_str(data).map_err(|source| DecodeError {
        event_type: kind.as_str().to_string(),
        payload: data.to_string(),
        source,
    })
}
