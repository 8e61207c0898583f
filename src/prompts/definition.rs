use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Nl2SqlError, Result};
use crate::prompts::parser::StructuredParser;

pub const DEFAULT_DIALECT: &str = "default";

/// Turns a parsed response into the stage's output type.
pub type PostProcessor<T> = Arc<dyn Fn(&Value) -> Result<T> + Send + Sync>;

/// A prompt variant: which template to render per dialect, how to parse the
/// answer and how to turn the parsed answer into a result.
pub struct PromptSpec<T> {
    pub id: String,
    pub templates: BTreeMap<String, String>,
    pub parser: Option<StructuredParser>,
    pub post_processor: PostProcessor<T>,
}

impl<T> Clone for PromptSpec<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            templates: self.templates.clone(),
            parser: self.parser.clone(),
            post_processor: Arc::clone(&self.post_processor),
        }
    }
}

impl<T> std::fmt::Debug for PromptSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptSpec")
            .field("id", &self.id)
            .field("templates", &self.templates)
            .field("parser", &self.parser)
            .finish()
    }
}

impl<T> PromptSpec<T> {
    /// A spec using the same template for every dialect.
    pub fn new(
        id: &str,
        template: &str,
        parser: Option<StructuredParser>,
        post_processor: impl Fn(&Value) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(DEFAULT_DIALECT.to_string(), template.to_string());
        Self {
            id: id.to_string(),
            templates,
            parser,
            post_processor: Arc::new(post_processor),
        }
    }

    /// Adds a template used only for `dialect`.
    pub fn with_dialect(mut self, dialect: &str, template: &str) -> Self {
        self.templates
            .insert(dialect.to_string(), template.to_string());
        self
    }

    /// Template for `dialect`, falling back to the default one.
    pub fn template_for(&self, dialect: &str) -> Result<&str> {
        self.templates
            .get(dialect)
            .or_else(|| self.templates.get(DEFAULT_DIALECT))
            .map(String::as_str)
            .ok_or_else(|| {
                Nl2SqlError::Configuration(format!(
                    "Prompt {} has no template for dialect {} and no default",
                    self.id, dialect
                ))
            })
    }

    pub fn format_instructions(&self) -> String {
        self.parser
            .as_ref()
            .map(|p| p.format_instructions())
            .unwrap_or_default()
    }

    /// Parses with the structured parser, or passes the raw text through as a string.
    pub fn parse(&self, raw: &str) -> Result<Value> {
        match &self.parser {
            Some(parser) => parser.parse(raw),
            None => Ok(Value::String(raw.to_string())),
        }
    }

    pub fn process(&self, parsed: &Value) -> Result<T> {
        (self.post_processor)(parsed)
    }
}

/// String field of a structured response.
pub fn string_field(parsed: &Value, field: &str) -> Result<String> {
    parsed
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Nl2SqlError::ResponseFormat(format!("\"{}\" is not a string", field))
        })
}

/// List-of-strings field of a structured response.
pub fn string_list_field(parsed: &Value, field: &str) -> Result<Vec<String>> {
    let items = parsed.get(field).and_then(Value::as_array).ok_or_else(|| {
        Nl2SqlError::ResponseFormat(format!("\"{}\" is not a list", field))
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                Nl2SqlError::ResponseFormat(format!("\"{}\" contains a non-string item", field))
            })
        })
        .collect()
}

/// Raw text of an unparsed response.
pub fn raw_text(parsed: &Value) -> Result<String> {
    parsed
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Nl2SqlError::ResponseFormat("Expected a plain text response".to_string()))
}
