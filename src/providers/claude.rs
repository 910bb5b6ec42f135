pub mod assembler;
pub mod client;
pub mod handle;
pub mod types;

pub use assembler::{Progress, ResponseAssembler};
pub use client::ClaudeClient;
pub use handle::{CloseHandle, StreamHandle};
pub use types::{MessageResponse, Snapshot, StopReason, Usage};
