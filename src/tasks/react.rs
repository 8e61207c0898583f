//! Agent-style SQL generation: the model lists tables, reads schemas and runs
//! queries through tools until it gives a final answer or runs out of turns.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::db::executor::QueryOutput;
use crate::error::{Nl2SqlError, Result};
use crate::llm::TextGenerator;
use crate::prompts::definition::raw_text;
use crate::prompts::{PromptRegistry, PromptSpec};
use crate::tasks::generation::GenerationResult;
use crate::tasks::run_prompt;

const STAGE: &str = "sql_generation";

pub const DEFAULT_MAX_ITERATIONS: usize = 15;

const LIST_TABLES: &str = "sql_db_list_tables";
const SCHEMA: &str = "sql_db_schema";
const QUERY: &str = "sql_db_query";

static ACTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Action\s*:\s*(.*?)\s*\n\s*Action\s*Input\s*:\s*(.*)").unwrap());
static QUERY_CLEANUP_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)sql```|```(?:sql)?|;").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactAction {
    Tool { name: String, input: String },
    Final { answer: String },
}

/// Reads one agent turn. Anything the model wrote after its first
/// `Observation:` is invented and ignored.
pub fn parse_react_output(text: &str) -> Result<ReactAction> {
    let turn = text.split("Observation:").next().unwrap_or(text);

    if let Some(caps) = ACTION_REGEX.captures(turn) {
        let name = caps.get(1).map_or("", |m| m.as_str()).trim();
        let input = caps.get(2).map_or("", |m| m.as_str());
        return Ok(ReactAction::Tool {
            name: name.trim_matches('`').to_string(),
            input: input.trim().trim_matches('"').trim().to_string(),
        });
    }
    if let Some((_, answer)) = turn.rsplit_once("Final Answer:") {
        return Ok(ReactAction::Final {
            answer: answer.trim().to_string(),
        });
    }
    Err(Nl2SqlError::ResponseFormat(
        "expected `Action:` with `Action Input:`, or `Final Answer:`".to_string(),
    ))
}

fn clean_query(input: &str) -> String {
    QUERY_CLEANUP_REGEX.replace_all(input, "").trim().to_string()
}

fn format_rows(output: &QueryOutput) -> String {
    let rows = output
        .rows
        .iter()
        .map(|row| format!("({})", row.join(", ")))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{}]", rows)
}

pub struct ReactGenerator {
    pub spec: PromptSpec<ReactAction>,
    pub top_k: usize,
    pub max_iterations: usize,
}

impl ReactGenerator {
    pub fn new(top_k: usize, max_iterations: usize) -> Self {
        Self {
            spec: PromptSpec::new("sql_generation_react", "sql_generation_react.j2", None, |v| {
                parse_react_output(&raw_text(v)?)
            }),
            top_k,
            max_iterations,
        }
    }

    async fn observe(&self, db: &Database, tool: &str, input: &str, last_query: &mut Option<String>) -> String {
        match tool {
            LIST_TABLES => db.view.usable_tables().join(", "),
            SCHEMA => {
                let usable = db.view.usable_tables();
                input
                    .split(',')
                    .map(|name| name.trim().trim_matches('"'))
                    .filter(|name| !name.is_empty())
                    .map(|name| {
                        if usable.iter().any(|t| t == name) {
                            db.view.table_description(name)
                        } else {
                            format!("Error: table {} not found", name)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            QUERY => {
                let sql = clean_query(input);
                let observation = match db.execute(&sql).await {
                    Ok(output) => format_rows(&output),
                    Err(e) => format!("Error: {}", e.first_line()),
                };
                *last_query = Some(sql);
                observation
            }
            other => format!(
                "{} is not a valid tool, try one of [{}, {}, {}].",
                other, LIST_TABLES, SCHEMA, QUERY
            ),
        }
    }

    /// The generated query is the last one the agent ran, whatever its final
    /// answer says.
    pub async fn generate(
        &self,
        llm: &dyn TextGenerator,
        registry: &PromptRegistry,
        db: &Database,
        question: &str,
    ) -> Result<GenerationResult> {
        let mut scratchpad = String::new();
        let mut intermediate_steps = Vec::new();
        let mut last_query: Option<String> = None;

        for iteration in 1..=self.max_iterations {
            let vars = json!({
                "question": question,
                "dialect": db.dialect(),
                "top_k": self.top_k,
                "scratchpad": scratchpad,
            });
            let (step, action) = run_prompt(
                llm,
                registry,
                &self.spec,
                db.dialect(),
                &vars,
                STAGE,
                Some(format!("iteration_{}", iteration)),
            )
            .await?;
            let turn = step.raw_response.clone().unwrap_or_default();
            let turn = turn.split("Observation:").next().unwrap_or("").trim_end().to_string();
            intermediate_steps.push(step);

            let observation = match action {
                Some(ReactAction::Final { answer }) => {
                    info!("[{}] agent finished after {} turns: {}", STAGE, iteration, answer);
                    break;
                }
                Some(ReactAction::Tool { name, input }) => {
                    debug!("[{}] agent calls {} with {}", STAGE, name, input);
                    self.observe(db, &name, &input, &mut last_query).await
                }
                None => "Invalid Format: use `Action:` and `Action Input:`, or `Final Answer:`".to_string(),
            };
            scratchpad.push_str(&format!("{}\nObservation: {}\nThought: ", turn, observation));

            if iteration == self.max_iterations {
                warn!("[{}] agent stopped after {} turns", STAGE, iteration);
            }
        }

        if last_query.is_none() {
            warn!("[{}] agent never ran a query", STAGE);
        }

        Ok(GenerationResult {
            question: question.to_string(),
            generated_query: last_query.filter(|q| !q.is_empty()),
            intermediate_steps,
        })
    }
}
