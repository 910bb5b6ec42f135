use std::io::Write;

use log::debug;

use crate::core::store::ConversationStore;
use crate::core::ChatError;
use crate::providers::claude::{StopReason, Usage};
use crate::providers::{Message, MessagesApi};

/// Result of one completed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub content: String,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

/// Sends a user turn together with the stored history of its conversation and
/// records the exchange once the assistant has finished.
pub struct ConversationManager<S: ConversationStore> {
    client: Box<dyn MessagesApi>,
    store: S,
}

impl<S: ConversationStore> ConversationManager<S> {
    pub fn new(client: Box<dyn MessagesApi>, store: S) -> Self {
        Self { client, store }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Runs one exchange, writing the assistant's text to `writer`.
    ///
    /// With `stream`, fragments are written as they arrive. If the stream
    /// fails, the text already written stays on screen, nothing is stored and
    /// the error is returned.
    pub async fn send<W: Write + Send>(
        &mut self,
        conversation_id: i64,
        text: &str,
        stream: bool,
        writer: &mut W,
    ) -> Result<TurnOutcome, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::InvalidInput("Message must not be empty".to_string()));
        }
        if self.store.conversation(conversation_id).await?.is_none() {
            return Err(ChatError::InvalidInput(format!(
                "No conversation with id {conversation_id}"
            )));
        }

        let mut messages: Vec<Message> = self
            .store
            .messages(conversation_id)
            .await?
            .iter()
            .map(Message::from)
            .collect();
        messages.push(Message::user(text));
        debug!(
            "[Conversation] {conversation_id}: sending {} messages (stream: {stream})",
            messages.len()
        );

        let outcome = if stream {
            self.stream_reply(&messages, writer).await?
        } else {
            let response = self.client.create_message(&messages).await?;
            let content = response.text();
            writer.write_all(content.as_bytes())?;
            writer.flush()?;
            TurnOutcome {
                content,
                stop_reason: response.stop_reason,
                usage: response.usage,
            }
        };

        self.store
            .append_exchange(conversation_id, text, &outcome.content)
            .await?;
        debug!(
            "[Conversation] {conversation_id}: stored reply ({:?}, {} output tokens)",
            outcome.stop_reason, outcome.usage.output_tokens
        );
        Ok(outcome)
    }

    async fn stream_reply<W: Write + Send>(
        &self,
        messages: &[Message],
        writer: &mut W,
    ) -> Result<TurnOutcome, ChatError> {
        let mut handle = self.client.create_message_stream(messages).await?;

        loop {
            match handle.receive().await {
                Ok(Some(snapshot)) => {
                    let fragment = snapshot.text();
                    if !fragment.is_empty() {
                        writer.write_all(fragment.as_bytes())?;
                        writer.flush()?;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    handle.close();
                    return Err(e.into());
                }
            }
        }

        let (stop_reason, usage) = handle
            .last_snapshot()
            .map(|s| (s.stop_reason.clone(), s.usage))
            .unwrap_or_default();
        Ok(TurnOutcome {
            content: handle.transcript().to_string(),
            stop_reason,
            usage,
        })
    }
}
