//! Prompt templates, response parsing and the pairing of the two.

pub mod definition;
pub mod parser;

use minijinja::Environment;
use rust_embed::RustEmbed;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Nl2SqlError, Result};

pub use definition::PromptSpec;
pub use parser::StructuredParser;

#[derive(RustEmbed)]
#[folder = "prompts/"]
struct PromptAssets;

/// All prompt templates known to the application, keyed by file name.
pub struct PromptRegistry {
    env: Environment<'static>,
}

impl PromptRegistry {
    /// Registry preloaded with the embedded templates.
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();

        for name in PromptAssets::iter() {
            let Some(content) = PromptAssets::get(&name) else {
                continue;
            };
            let source = String::from_utf8_lossy(&content.data).to_string();
            env.add_template_owned(name.to_string(), source)?;
            debug!("Registered prompt template {}", name);
        }

        Ok(Self { env })
    }

    /// Adds or replaces a template at runtime.
    pub fn add_template(&mut self, name: &str, source: &str) -> Result<()> {
        self.env
            .add_template_owned(name.to_string(), source.to_string())?;
        Ok(())
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Renders `name` with the entries of `vars` the template actually references.
    pub fn render(&self, name: &str, vars: &Value) -> Result<String> {
        let template = self.env.get_template(name).map_err(|_| {
            Nl2SqlError::Configuration(format!("Prompt template {} is not registered", name))
        })?;

        let declared = template.undeclared_variables(false);
        let context: Map<String, Value> = vars
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(key, _)| declared.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(template.render(&context)?)
    }
}
