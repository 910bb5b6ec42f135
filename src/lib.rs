pub mod cli;
pub mod core;
pub mod eventsource;
pub mod providers;

pub use crate::core::{ChatError, Config, ConversationManager, StreamError};
pub use providers::claude::{ClaudeClient, StreamHandle};
pub use providers::MessagesApi;
