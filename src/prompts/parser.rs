use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Nl2SqlError, Result};

static JSON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Extracts a JSON object with a fixed set of fields from a model response.
#[derive(Debug, Clone)]
pub struct StructuredParser {
    fields: Vec<(String, String)>,
}

impl StructuredParser {
    /// `fields` are `(name, description)` pairs, all of them required.
    pub fn new(fields: &[(&str, &str)]) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|(name, description)| (name.to_string(), description.to_string()))
                .collect(),
        }
    }

    /// Text appended to prompts so the model answers in the parseable shape.
    pub fn format_instructions(&self) -> String {
        let body = self
            .fields
            .iter()
            .map(|(name, description)| format!("\t\"{}\": {}", name, description))
            .collect::<Vec<_>>()
            .join(",\n");
        format!(
            "The output should be a markdown code snippet formatted in the following schema, \
             including the leading and trailing \"```json\" and \"```\":\n\n```json\n{{\n{}\n}}\n```",
            body
        )
    }

    pub fn parse(&self, text: &str) -> Result<Value> {
        let candidate = match JSON_BLOCK.captures(text).and_then(|c| c.get(1)) {
            Some(block) => block.as_str(),
            None => match (text.find('{'), text.rfind('}')) {
                (Some(start), Some(end)) if start < end => &text[start..=end],
                _ => {
                    return Err(Nl2SqlError::ResponseFormat(format!(
                        "No JSON object found in response: {}",
                        text
                    )));
                }
            },
        };

        let value: Value = serde_json::from_str(candidate).map_err(|e| {
            Nl2SqlError::ResponseFormat(format!("Invalid JSON in response: {}", e))
        })?;

        let Some(object) = value.as_object() else {
            return Err(Nl2SqlError::ResponseFormat(
                "Response is not a JSON object".to_string(),
            ));
        };
        if let Some((missing, _)) = self.fields.iter().find(|(name, _)| !object.contains_key(name)) {
            return Err(Nl2SqlError::ResponseFormat(format!(
                "Response is missing the \"{}\" field",
                missing
            )));
        }

        Ok(value)
    }
}
