use std::collections::HashMap;

use super::Message;
use crate::core::ClaudeConfig;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<Message<'a>>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    #[serde(flatten)]
    pub custom_metadata: HashMap<String, serde_json::Value>,
}

impl<'a> MessagesRequest<'a> {
    pub const fn new(model: &'a str, max_tokens: u32, messages: Vec<Message<'a>>) -> Self {
        Self {
            model,
            max_tokens,
            messages,
            metadata: None,
            stop_sequences: None,
            stream: None,
            system: None,
            temperature: None,
            top_k: None,
            top_p: None,
        }
    }

    /// Starts a request carrying the model and sampling settings from `config`.
    pub fn from_config(config: &'a ClaudeConfig, messages: Vec<Message<'a>>) -> Self {
        let mut request = Self::new(&config.model, config.max_tokens, messages);
        request.temperature = config.temperature;
        request.top_p = config.top_p;
        request.top_k = config.top_k;
        request
    }

    pub const fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub const fn with_system(mut self, system: Option<&'a str>) -> Self {
        self.system = system;
        self
    }

    pub fn with_stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.stop_sequences = Some(stop_sequences);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
