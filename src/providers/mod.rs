pub mod claude;
pub mod llm;
pub mod types;

pub use llm::MessagesApi;
pub use types::messages::{Message, Role};
