//! Folds decoded stream deltas into a single response snapshot.
//!
//! The text block of a snapshot holds only the fragment carried by the most
//! recent `content_block_delta`; concatenating fragments into a transcript is
//! up to the consumer.

use log::{debug, trace};

use super::types::{ContentBlock, Delta, EventClass, Snapshot};
use crate::core::StreamError;
use crate::eventsource::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingStart,
    Streaming,
    Terminated,
}

/// What the consumer should see after folding one delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Snapshot(Snapshot),
    /// `message_stop` was received; no further snapshots follow.
    Complete,
}

#[derive(Debug)]
pub struct ResponseAssembler {
    state: State,
    snapshot: Option<Snapshot>,
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAssembler {
    pub const fn new() -> Self {
        Self {
            state: State::AwaitingStart,
            snapshot: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// Classifies, decodes and folds one raw event.
    ///
    /// Returns `Ok(None)` for events that leave the snapshot untouched.
    pub fn handle_event(&mut self, event: &Event) -> Result<Option<Progress>, StreamError> {
        let kind = match EventClass::classify(event.kind()) {
            EventClass::Meaningful(kind) => kind,
            EventClass::Ignored => {
                trace!("[Stream] skipping {} event", event.kind());
                return Ok(None);
            }
            EventClass::Unknown => {
                debug!("[Stream] dropping unknown event type {:?}", event.kind());
                return Ok(None);
            }
        };

        match Delta::decode(kind, &event.data) {
            Ok(delta) => self.apply(delta).map(Some),
            Err(e) => {
                self.state = State::Terminated;
                Err(e.into())
            }
        }
    }

    /// Folds a decoded delta into the snapshot.
    pub fn apply(&mut self, delta: Delta) -> Result<Progress, StreamError> {
        let result = self.transition(delta);
        if !matches!(result, Ok(Progress::Snapshot(_))) {
            self.state = State::Terminated;
        }
        result
    }

    fn transition(&mut self, delta: Delta) -> Result<Progress, StreamError> {
        match (self.state, delta) {
            (State::Terminated, _) => Err(StreamError::Protocol(
                "event received after the stream terminated".to_string(),
            )),
            (_, Delta::Error { error_type, message }) => {
                debug!("[Stream] error event ({error_type}): {message}");
                Err(StreamError::Protocol(message))
            }
            (State::AwaitingStart, Delta::MessageStart { mut message }) => {
                message.content = vec![ContentBlock::text("")];
                self.state = State::Streaming;
                Ok(Progress::Snapshot(self.snapshot.insert(message).clone()))
            }
            (State::AwaitingStart, delta) => Err(StreamError::Protocol(format!(
                "{} received before message_start",
                delta_name(&delta)
            ))),
            (State::Streaming, Delta::MessageStart { .. }) => Err(StreamError::Protocol(
                "duplicate message_start".to_string(),
            )),
            (State::Streaming, Delta::ContentBlockDelta { text, .. }) => {
                let snapshot = self.streaming_snapshot()?;
                snapshot.content = vec![ContentBlock::text(text)];
                Ok(Progress::Snapshot(snapshot.clone()))
            }
            (
                State::Streaming,
                Delta::MessageDelta {
                    stop_reason,
                    stop_sequence,
                    output_tokens,
                },
            ) => {
                let snapshot = self.streaming_snapshot()?;
                snapshot.stop_reason = stop_reason;
                snapshot.stop_sequence = stop_sequence;
                snapshot.usage.output_tokens = output_tokens;
                snapshot.content = vec![ContentBlock::text("")];
                Ok(Progress::Snapshot(snapshot.clone()))
            }
            (State::Streaming, Delta::MessageStop) => Ok(Progress::Complete),
        }
    }

    fn streaming_snapshot(&mut self) -> Result<&mut Snapshot, StreamError> {
        self.snapshot
            .as_mut()
            .ok_or_else(|| StreamError::Protocol("no message in progress".to_string()))
    }
}

const fn delta_name(delta: &Delta) -> &'static str {
    match delta {
        Delta::MessageStart { .. } => "message_start",
        Delta::ContentBlockDelta { .. } => "content_block_delta",
        Delta::MessageDelta { .. } => "message_delta",
        Delta::MessageStop => "message_stop",
        Delta::Error { .. } => "error",
    }
}
