#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(reqwest::Error),
    /// Non-success response from the Messages API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    /// Authentication-specific errors
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// Response parsing errors (missing fields, invalid format)
    #[error("Failed to parse response: {0}")]
    ResponseFormat(String),
    /// Terminal failure of a streaming response
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Conversation store errors
    #[error("Store error: {0}")]
    Store(String),
    /// I/O error
    #[error("I/O error: {0}")]
    IOError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Bad user input on the command line
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Terminal result of a streaming response other than an orderly end of stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A recognised event carried a payload that could not be parsed
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The server sent an `error` event, or the event sequence was malformed
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The connection failed or ended before `message_stop`
    #[error("Transport error: {0}")]
    Transport(String),
    /// The stream handle was closed by the caller
    #[error("Stream closed")]
    Closed,
}

/// A meaningful event whose JSON payload did not match its declared type.
#[derive(Debug, thiserror::Error)]
#[error("Failed to decode `{event_type}` event: {source} (payload: {payload})")]
pub struct DecodeError {
    pub event_type: String,
    pub payload: String,
    #[source]
    pub source: serde_json::Error,
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(err.to_string())
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(format!("Database error: {err}"))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        // If the error has a status code, map it to a more specific error
        match err.status() {
            Some(status) if matches!(status.as_u16(), 401 | 403) => {
                Self::Authentication(format!("Authentication failed: {err}"))
            }
            Some(status) => Self::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Network(err),
        }
    }
}
