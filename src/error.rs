use thiserror::Error;

use crate::db::executor::ExecutionError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum Nl2SqlError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("response format error: {0}")]
    ResponseFormat(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Nl2SqlError {
    /// Errors that only affect a single LLM call and can be recorded instead of raised.
    pub fn is_call_local(&self) -> bool {
        matches!(self, Nl2SqlError::ResponseFormat(_))
    }
}

pub type Result<T> = std::result::Result<T, Nl2SqlError>;
