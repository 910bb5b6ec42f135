use crate::core::ChatError;
use crate::providers::claude::{MessageResponse, StreamHandle};
use crate::providers::Message;
use async_trait::async_trait;

#[async_trait]
pub trait MessagesApi: Send + Sync {
    /// Send the conversation and wait for the complete response
    async fn create_message(&self, messages: &[Message]) -> Result<MessageResponse, ChatError>;

    /// Send the conversation with streaming enabled.
    ///
    /// Fails if the connection cannot be established or the API rejects the
    /// request; failures after that are reported through the handle.
    async fn create_message_stream(&self, messages: &[Message]) -> Result<StreamHandle, ChatError>;
}
