// src/config/llm.rs
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::PipelineError;

pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_connect_timeout() -> u64 {
    4
}
fn default_timeout() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}

/// Analysis endpoint settings (`[llm]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-request timeout; retries are layered on top by the dispatcher.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: default_api_key(),
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_timeout(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    /// Resolve the "ENV" placeholder and sanitize numbers. A missing key is a
    /// setup defect only when the endpoint is enabled.
    pub fn resolve(&mut self) -> Result<(), PipelineError> {
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = match env::var(ENV_OPENAI_API_KEY) {
                Ok(k) if !k.trim().is_empty() => k.trim().to_string(),
                _ if self.enabled => {
                    return Err(PipelineError::Config(format!(
                        "Missing {ENV_OPENAI_API_KEY} env var"
                    )))
                }
                _ => String::new(),
            };
        }

        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout();
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        Ok(())
    }
}
