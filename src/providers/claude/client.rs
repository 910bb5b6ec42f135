use crate::core::{ChatError, ClaudeConfig};
use crate::eventsource::EventSourceExt;
use crate::providers::llm::MessagesApi;
use crate::providers::Message as LLMMessage;
use async_trait::async_trait;
use log::debug;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Client, StatusCode,
};

use super::handle::StreamHandle;
use super::types::{ApiErrorBody, Message, MessageResponse, MessagesRequest};

/// Client for the Anthropic Messages API
pub struct ClaudeClient {
    api_key: String,
    client: Client,
    config: ClaudeConfig,
    system_prompt: Option<String>,
}

impl ClaudeClient {
    /// Create a new Claude client with the given API key
    pub fn new(api_key: String, config: ClaudeConfig) -> Self {
        Self {
            api_key,
            client: Client::new(),
            config,
            system_prompt: None,
        }
    }

    /// Send `system_prompt` with every request
    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Build headers for API requests
    fn build_headers(&self, stream: bool) -> Result<HeaderMap, ChatError> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(&self.api_key).map_err(|_| {
            ChatError::ConfigError("API key contains invalid header characters".to_string())
        })?;
        headers.insert("x-api-key", api_key);
        let version = HeaderValue::from_str(&self.config.api_version).map_err(|_| {
            ChatError::ConfigError(format!("Invalid API version {:?}", self.config.api_version))
        })?;
        headers.insert("anthropic-version", version);

        if let Some(beta) = self.config.beta.as_deref().filter(|b| !b.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(beta) {
                headers.insert("anthropic-beta", value);
            }
        }
        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        Ok(headers)
    }

    fn build_request<'a>(&'a self, messages: &'a [LLMMessage], stream: bool) -> MessagesRequest<'a> {
        let claude_messages: Vec<Message> = messages.iter().map(Message::from).collect();
        let request = MessagesRequest::from_config(&self.config, claude_messages)
            .with_system(self.system_prompt.as_deref());
        if stream {
            request.with_stream(true)
        } else {
            request
        }
    }

    async fn request_messages(
        &self,
        request: &MessagesRequest<'_>,
        stream: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let url = format!("{}/messages", self.config.base_url.trim_end_matches('/'));
        debug!("[Claude] POST {url} (stream: {stream}, model: {})", request.model);

        let response = self
            .client
            .post(url)
            .headers(self.build_headers(stream)?)
            .json(request)
            .send()
            .await
            .map_err(ChatError::Network)?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(api_error(status, &body))
            }
        }
    }
}

/// Maps a non-success response to an error, preferring the API's own message.
fn api_error(status: StatusCode, body: &str) -> ChatError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body.trim().to_string()
            }
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Authentication(message),
        _ => ChatError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl MessagesApi for ClaudeClient {
    async fn create_message(&self, messages: &[LLMMessage]) -> Result<MessageResponse, ChatError> {
        let request = self.build_request(messages, false);
        let response = self.request_messages(&request, false).await?;
        response.json().await.map_err(|e| {
            ChatError::ResponseFormat(format!("Failed to parse Claude response: {e}"))
        })
    }

    async fn create_message_stream(
        &self,
        messages: &[LLMMessage],
    ) -> Result<StreamHandle, ChatError> {
        let request = self.build_request(messages, true);
        let response = self.request_messages(&request, true).await?;
        Ok(StreamHandle::spawn(response.events()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Config, StreamError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SSE_BODY: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_9\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-3-5-haiku-20241022\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\": \"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":2}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    /// Serves one canned HTTP response and returns the raw request it received.
    async fn serve_once(
        status_line: &'static str,
        content_type: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base_url, server)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn client(base_url: String) -> ClaudeClient {
        let mut config = Config::default().claude;
        config.base_url = base_url;
        config.model = "claude-3-5-haiku-20241022".to_string();
        config.beta = Some("prompt-caching-2024-07-31".to_string());
        ClaudeClient::new("test-key".to_string(), config)
            .with_system_prompt(Some("Be brief.".to_string()))
    }

    #[test]
    fn test_build_headers() {
        let client = client("http://localhost/v1".to_string());
        let headers = client.build_headers(true).unwrap();
        assert_eq!(headers["x-api-key"], "test-key");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert_eq!(headers["anthropic-beta"], "prompt-caching-2024-07-31");
        assert_eq!(headers[ACCEPT], "text/event-stream");
        assert!(client.build_headers(false).unwrap().get(ACCEPT).is_none());
    }

    #[test]
    fn test_invalid_api_key_header() {
        let client = ClaudeClient::new("bad\nkey".to_string(), Config::default().claude);
        assert!(matches!(
            client.build_headers(false),
            Err(ChatError::ConfigError(_))
        ));
    }

    #[test]
    fn test_api_error_mapping() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        assert!(matches!(
            api_error(StatusCode::UNAUTHORIZED, body),
            ChatError::Authentication(ref msg) if msg == "invalid x-api-key"
        ));

        let overloaded = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(
            api_error(StatusCode::from_u16(529).unwrap(), overloaded),
            ChatError::Api { status: 529, ref message } if message == "Overloaded"
        ));

        assert!(matches!(
            api_error(StatusCode::BAD_GATEWAY, ""),
            ChatError::Api { status: 502, ref message } if message == "Bad Gateway"
        ));
    }

    #[tokio::test]
    async fn test_stream_over_http() {
        let (base_url, server) = serve_once("HTTP/1.1 200 OK", "text/event-stream", SSE_BODY).await;
        let client = client(base_url);

        let mut handle = client
            .create_message_stream(&[LLMMessage::user("Hello")])
            .await
            .unwrap();

        let mut texts = Vec::new();
        let end = loop {
            match handle.receive().await {
                Ok(Some(snapshot)) => texts.push(snapshot.text()),
                other => break other,
            }
        };
        assert!(matches!(end, Ok(None)));
        assert_eq!(texts, vec!["", "Hi", " there", ""]);
        assert_eq!(handle.transcript(), "Hi there");
        let last = handle.last_snapshot().unwrap();
        assert_eq!(last.id, "msg_9");
        assert_eq!(last.usage.output_tokens, 2);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/messages"));
        assert!(request.contains("\"stream\":true"));
        assert!(request.contains("\"system\":\"Be brief.\""));
        assert!(request.to_lowercase().contains("accept: text/event-stream"));
    }

    #[tokio::test]
    async fn test_stream_rejected_before_open() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let (base_url, _server) =
            serve_once("HTTP/1.1 401 Unauthorized", "application/json", body).await;

        let result = client(base_url)
            .create_message_stream(&[LLMMessage::user("Hello")])
            .await;
        assert!(matches!(result, Err(ChatError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        drop(listener);

        let result = client(base_url)
            .create_message_stream(&[LLMMessage::user("Hello")])
            .await;
        assert!(matches!(result, Err(ChatError::Network(_))));
    }

    #[tokio::test]
    async fn test_create_message() {
        let body = r#"{"id":"msg_2","type":"message","role":"assistant","content":[{"type":"text","text":"Hello!"}],"model":"claude-3-5-haiku-20241022","stop_reason":"end_turn","stop_sequence":null,"usage":{"input_tokens":4,"output_tokens":2}}"#;
        let (base_url, server) = serve_once("HTTP/1.1 200 OK", "application/json", body).await;

        let response = client(base_url)
            .create_message(&[LLMMessage::user("Hello")])
            .await
            .unwrap();
        assert_eq!(response.text(), "Hello!");

        let request = server.await.unwrap();
        assert!(!request.contains("\"stream\""));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_transport_error() {
        let (base_url, _server) = serve_once(
            "HTTP/1.1 200 OK",
            "text/event-stream",
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"role\":\"assistant\",\"model\":\"x\",\"stop_reason\":null,\"stop_sequence\":null}}\n\n",
        )
        .await;

        let mut handle = client(base_url)
            .create_message_stream(&[LLMMessage::user("Hello")])
            .await
            .unwrap();
        assert!(handle.receive().await.unwrap().is_some());
        assert!(matches!(
            handle.receive().await,
            Err(StreamError::Transport(_))
        ));
    }
}
