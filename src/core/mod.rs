mod config;
pub mod conversation;
pub mod error;
pub mod store;

pub use config::ClaudeConfig;
pub use config::Config;
pub use conversation::{ConversationManager, TurnOutcome};
pub use error::{ChatError, DecodeError, StreamError};
pub use store::{ConversationStore, MemoryStore, SqliteStore};
