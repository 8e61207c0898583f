//! LLM-backed pipeline stages.

pub mod generation;
pub mod react;
pub mod repair;
pub mod selection;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::{TextGenerator, first_candidate};
use crate::prompts::{PromptRegistry, PromptSpec};

/// Record of one LLM call made by a stage.
#[derive(Debug, Clone, Serialize)]
pub struct IntermediateStep {
    pub stage: String,
    /// Table, join or trial the call was about; `None` for whole-schema calls
    pub scope: Option<String>,
    pub prompt_id: String,
    pub prepared_prompt: String,
    pub raw_response: Option<String>,
    pub parsed_response: Option<Value>,
    pub processed_response: Option<Value>,
    pub error: Option<String>,
}

/// Renders `spec` for `dialect`, calls the model once and post-processes the
/// first candidate.
///
/// Response format errors are recorded on the returned step with `None` as the
/// output. Everything else (templates, rendering, transport) propagates.
pub(crate) async fn run_prompt<T: Serialize>(
    llm: &dyn TextGenerator,
    registry: &PromptRegistry,
    spec: &PromptSpec<T>,
    dialect: &str,
    vars: &Value,
    stage: &str,
    scope: Option<String>,
) -> Result<(IntermediateStep, Option<T>)> {
    let template = spec.template_for(dialect)?;
    let prepared_prompt = registry.render(template, vars)?;
    debug!("[{}] prompt {} rendered:\n{}", stage, spec.id, prepared_prompt);

    let raw = first_candidate(llm.generate(&prepared_prompt).await?)?;
    debug!("[{}] raw response: {}", stage, raw);

    let mut step = IntermediateStep {
        stage: stage.to_string(),
        scope,
        prompt_id: spec.id.clone(),
        prepared_prompt,
        raw_response: Some(raw.clone()),
        parsed_response: None,
        processed_response: None,
        error: None,
    };

    let parsed = match spec.parse(&raw) {
        Ok(parsed) => parsed,
        Err(e) if e.is_call_local() => {
            warn!("[{}] unparseable response to {}: {}", stage, spec.id, e);
            step.error = Some(e.to_string());
            return Ok((step, None));
        }
        Err(e) => return Err(e),
    };
    step.parsed_response = Some(parsed.clone());

    match spec.process(&parsed) {
        Ok(output) => {
            step.processed_response = serde_json::to_value(&output).ok();
            Ok((step, Some(output)))
        }
        Err(e) if e.is_call_local() => {
            warn!("[{}] unusable response to {}: {}", stage, spec.id, e);
            step.error = Some(e.to_string());
            Ok((step, None))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::db::executor::{ExecutionError, QueryOutput, SqlExecutor};
    use crate::llm::{LlmError, TextGenerator};

    /// Replays scripted responses in order and records every prompt it saw.
    /// Once the script runs out the last response repeats, or nothing comes
    /// back at all for [`ScriptedLlm::then_silent`].
    pub(crate) struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
        last: Mutex<String>,
        silent_when_done: bool,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        pub(crate) fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
                last: Mutex::new(String::new()),
                silent_when_done: false,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn then_silent(responses: &[&str]) -> Self {
            Self {
                silent_when_done: true,
                ..Self::new(responses)
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedLlm {
        async fn generate(&self, prompt: &str) -> Result<Vec<String>, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut last = self.last.lock().unwrap();
            match self.responses.lock().unwrap().pop_front() {
                Some(next) => *last = next,
                None if self.silent_when_done => return Ok(Vec::new()),
                None => {}
            }
            Ok(vec![last.clone()])
        }
    }

    /// A model that returns no candidates at all.
    pub(crate) struct SilentLlm;

    #[async_trait]
    impl TextGenerator for SilentLlm {
        async fn generate(&self, _prompt: &str) -> Result<Vec<String>, LlmError> {
            Ok(Vec::new())
        }
    }

    /// Fails every statement that does not contain one of `accepted`.
    pub(crate) struct FakeExecutor {
        pub dialect: String,
        pub accepted: Vec<String>,
        pub executions: AtomicUsize,
        pub statements: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub(crate) fn new(dialect: &str, accepted: &[&str]) -> Self {
            Self {
                dialect: dialect.to_string(),
                accepted: accepted.iter().map(|s| s.to_string()).collect(),
                executions: AtomicUsize::new(0),
                statements: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SqlExecutor for FakeExecutor {
        fn dialect(&self) -> &str {
            &self.dialect
        }

        async fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutionError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.statements.lock().unwrap().push(sql.to_string());
            if self.accepted.iter().any(|a| sql.contains(a.as_str())) {
                Ok(QueryOutput {
                    columns: vec!["n".to_string()],
                    rows: vec![vec!["1".to_string()]],
                    row_count: 1,
                    truncated: false,
                    execution_time_ms: 0,
                })
            } else {
                Err(ExecutionError::new(format!(
                    "Parser Error: syntax error in \"{}\"\nLINE 1: {}\n        ^",
                    sql, sql
                )))
            }
        }
    }
}
