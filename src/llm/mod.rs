pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
    EmptyResponse,
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
            LlmError::EmptyResponse => write!(f, "LLM returned no candidates"),
        }
    }
}

impl Error for LlmError {}

/// A text completion backend. Returns every candidate the model produced for the prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Vec<String>, LlmError>;
}

/// Takes the first candidate of a generation, trimmed. No candidates is a hard error.
pub fn first_candidate(candidates: Vec<String>) -> Result<String, LlmError> {
    candidates
        .into_iter()
        .next()
        .map(|text| text.trim().to_string())
        .ok_or(LlmError::EmptyResponse)
}

pub struct LlmManager {
    generator: Box<dyn TextGenerator>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let generator: Box<dyn TextGenerator> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self { generator })
    }
}

#[async_trait]
impl TextGenerator for LlmManager {
    async fn generate(&self, prompt: &str) -> Result<Vec<String>, LlmError> {
        self.generator.generate(prompt).await
    }
}
