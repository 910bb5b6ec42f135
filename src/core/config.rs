use crate::core::ChatError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

include!(concat!(env!("OUT_DIR"), "/config_embedded.rs"));

/// Connection and sampling settings for the Messages API.
#[derive(Debug, Deserialize, Clone)]
pub struct ClaudeConfig {
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    pub api_version: String,
    /// Value for the `anthropic-beta` header
    pub beta: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub data_file: PathBuf,
    pub log_level: String,
    pub claude: ClaudeConfig,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("Invalid embedded default config")
    }
}

impl Config {
    /// Loads the config at `path`, falling back to the embedded defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .map_err(|e| ChatError::ConfigError(format!("Failed to read config file: {e}")))?;

            toml::from_str(&contents)
                .map_err(|e| ChatError::ConfigError(format!("Failed to parse config file: {e}")))
        } else {
            Ok(Self::default())
        }
    }

    /// Overwrites `path` with the embedded default config.
    pub fn write_defaults(path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)
            .map_err(|e| ChatError::ConfigError(format!("Failed to write config file: {e}")))
    }
}
