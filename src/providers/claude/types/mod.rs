pub mod message;
pub mod request;
pub mod stream;

pub use message::{
    ApiErrorBody, ApiErrorDetail, ContentBlock, Message, MessageResponse, StopReason, Usage,
};

pub use request::{MessagesRequest, Metadata};

pub use stream::{decode, Delta, EventClass, EventKind};

/// The assembled state of a streaming response.
pub type Snapshot = MessageResponse;
