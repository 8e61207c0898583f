use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::error::{Nl2SqlError, Result};
use crate::llm::TextGenerator;
use crate::prompts::definition::{raw_text, string_list_field};
use crate::prompts::{PromptRegistry, PromptSpec, StructuredParser};
use crate::schema::view::SchemaView;
use crate::tasks::{IntermediateStep, run_prompt};

static ANSWER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\banswer\s*:\s*(yes|no)\b").unwrap());
static YES_NO_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(yes|no)\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionTarget {
    Tables,
    Columns,
    Joins,
}

impl SelectionTarget {
    pub fn stage_name(&self) -> &'static str {
        match self {
            SelectionTarget::Tables => "table_selection",
            SelectionTarget::Columns => "column_selection",
            SelectionTarget::Joins => "join_selection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// One call listing every candidate
    Batched,
    /// One call per table (tables, columns) or per join condition
    PerCandidate,
}

/// What a selection prompt's post-processor produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOutput {
    Names(Vec<String>),
    /// Verdict on the candidate the call was scoped to
    Relevant(bool),
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionResult {
    pub target: SelectionTarget,
    pub available: Vec<String>,
    pub selected: Vec<String>,
    pub intermediate_steps: Vec<IntermediateStep>,
}

/// Deterministic yes/no reading of a free-text verdict. Prefers an explicit
/// `Answer: yes|no`, then the first standalone yes/no; anything else is a no.
pub fn classify_yes_no(text: &str) -> bool {
    let verdict = ANSWER_REGEX
        .captures(text)
        .or_else(|| YES_NO_REGEX.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());
    verdict.as_deref() == Some("yes")
}

fn split_names(text: &str) -> Vec<String> {
    text.split([',', '\n'])
        .map(|name| name.trim().trim_matches(|c: char| c == '`' || c == '"' || c == '\'').trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Keeps the available names some returned name matches case-insensitively,
/// in the order they are available.
fn match_available(available: &[String], returned: &[String]) -> Vec<String> {
    let wanted: HashSet<String> = returned.iter().map(|n| normalize(n)).collect();
    available
        .iter()
        .filter(|name| wanted.contains(&normalize(name)))
        .cloned()
        .collect()
}

/// Generic table, column or join selection over a schema view.
#[derive(Debug, Clone)]
pub struct SelectionStage {
    pub target: SelectionTarget,
    pub mode: SelectionMode,
    pub spec: PromptSpec<SelectionOutput>,
}

impl SelectionStage {
    pub fn new(target: SelectionTarget, mode: SelectionMode, spec: PromptSpec<SelectionOutput>) -> Self {
        Self { target, mode, spec }
    }

    /// Batched comma-separated list of relevant tables.
    pub fn table_decider() -> Self {
        Self::new(
            SelectionTarget::Tables,
            SelectionMode::Batched,
            PromptSpec::new("table_selection_decider", "table_selection_decider.j2", None, |v| {
                Ok(SelectionOutput::Names(split_names(&raw_text(v)?)))
            }),
        )
    }

    /// Per-table yes/no verdict with worked examples.
    pub fn table_few_shot_cot() -> Self {
        Self::new(
            SelectionTarget::Tables,
            SelectionMode::PerCandidate,
            PromptSpec::new("table_selection_cot", "table_selection_cot.j2", None, |v| {
                Ok(SelectionOutput::Relevant(classify_yes_no(&raw_text(v)?)))
            }),
        )
    }

    fn columns_spec(id: &str, template: &str) -> PromptSpec<SelectionOutput> {
        let parser = StructuredParser::new(&[
            ("thoughts", "string // why each column is needed"),
            ("columns", "list[string] // relevant columns as table.column"),
        ]);
        PromptSpec::new(id, template, Some(parser), |v| {
            Ok(SelectionOutput::Names(string_list_field(v, "columns")?))
        })
    }

    fn joins_spec(id: &str, template: &str) -> PromptSpec<SelectionOutput> {
        let parser = StructuredParser::new(&[
            ("thoughts", "string // why each join is needed"),
            ("joins", "list[string] // join conditions copied from the allowed list"),
        ]);
        PromptSpec::new(id, template, Some(parser), |v| {
            Ok(SelectionOutput::Names(string_list_field(v, "joins")?))
        })
    }

    pub fn column_zero_shot(mode: SelectionMode) -> Self {
        Self::new(
            SelectionTarget::Columns,
            mode,
            Self::columns_spec("column_selection_zero_shot", "column_selection.j2"),
        )
    }

    pub fn column_few_shot_cot(mode: SelectionMode) -> Self {
        Self::new(
            SelectionTarget::Columns,
            mode,
            Self::columns_spec("column_selection_few_shot_cot", "column_selection_cot.j2"),
        )
    }

    pub fn join_zero_shot() -> Self {
        Self::new(
            SelectionTarget::Joins,
            SelectionMode::Batched,
            Self::joins_spec("join_selection_zero_shot", "join_selection.j2"),
        )
    }

    pub fn join_few_shot_cot() -> Self {
        Self::new(
            SelectionTarget::Joins,
            SelectionMode::Batched,
            Self::joins_spec("join_selection_few_shot_cot", "join_selection_cot.j2"),
        )
    }

    /// Table stage by configuration name; `off` disables the stage.
    pub fn tables(variant: &str) -> Result<Option<Self>> {
        match variant {
            "decider" => Ok(Some(Self::table_decider())),
            "per_table" => Ok(Some(Self::table_few_shot_cot())),
            "off" => Ok(None),
            other => Err(Nl2SqlError::Configuration(format!(
                "Unknown table selection variant: {}",
                other
            ))),
        }
    }

    /// Column stage by configuration name; `off` disables the stage.
    pub fn columns(variant: &str) -> Result<Option<Self>> {
        match variant {
            "per_table" => Ok(Some(Self::column_zero_shot(SelectionMode::PerCandidate))),
            "batched" => Ok(Some(Self::column_zero_shot(SelectionMode::Batched))),
            "few_shot" => Ok(Some(Self::column_few_shot_cot(SelectionMode::PerCandidate))),
            "off" => Ok(None),
            other => Err(Nl2SqlError::Configuration(format!(
                "Unknown column selection variant: {}",
                other
            ))),
        }
    }

    /// Join stage by configuration name; `off` disables the stage.
    pub fn joins(variant: &str) -> Result<Option<Self>> {
        match variant {
            "zero_shot" => Ok(Some(Self::join_zero_shot())),
            "few_shot" => Ok(Some(Self::join_few_shot_cot())),
            "off" => Ok(None),
            other => Err(Nl2SqlError::Configuration(format!(
                "Unknown join selection variant: {}",
                other
            ))),
        }
    }

    fn available(&self, view: &SchemaView) -> Vec<String> {
        match self.target {
            SelectionTarget::Tables => view.usable_tables(),
            SelectionTarget::Columns => view.available_columns(),
            SelectionTarget::Joins => view.allowed_joins(),
        }
    }

    fn base_vars(&self, view: &SchemaView, question: &str) -> Value {
        json!({
            "question": question,
            "dialect": view.dialect,
            "format_instructions": self.spec.format_instructions(),
        })
    }

    /// `(scope, vars)` for every call this stage makes.
    fn calls(&self, view: &SchemaView, question: &str, available: &[String]) -> Vec<(Option<String>, Value)> {
        let mut vars = self.base_vars(view, question);

        match (self.mode, self.target) {
            (SelectionMode::Batched, target) => {
                vars["table_info"] = json!(view.table_info());
                vars["table_names"] = json!(view.usable_tables().join(", "));
                match target {
                    SelectionTarget::Tables => {}
                    SelectionTarget::Columns => vars["column_names"] = json!(available.join(", ")),
                    SelectionTarget::Joins => vars["allowed_joins"] = json!(available),
                }
                vec![(None, vars)]
            }
            (SelectionMode::PerCandidate, SelectionTarget::Tables | SelectionTarget::Columns) => view
                .usable_tables()
                .into_iter()
                .map(|table| {
                    let mut vars = vars.clone();
                    vars["table_name"] = json!(table);
                    vars["table_info"] = json!(view.table_description(&table));
                    vars["column_names"] = json!(view.table_columns(&table).join(", "));
                    (Some(table), vars)
                })
                .collect(),
            (SelectionMode::PerCandidate, SelectionTarget::Joins) => {
                vars["table_info"] = json!(view.table_info());
                available
                    .iter()
                    .map(|join| {
                        let mut vars = vars.clone();
                        vars["join"] = json!(join);
                        vars["allowed_joins"] = json!([join]);
                        (Some(join.clone()), vars)
                    })
                    .collect()
            }
        }
    }

    /// Names one call's output refers to, before matching against `available`.
    fn returned_names(&self, view: &SchemaView, scope: Option<&str>, output: SelectionOutput) -> Vec<String> {
        match output {
            SelectionOutput::Relevant(false) => Vec::new(),
            SelectionOutput::Relevant(true) => match (scope, self.target) {
                (Some(table), SelectionTarget::Columns) => view
                    .table_columns(table)
                    .into_iter()
                    .map(|c| format!("{}.{}", table, c))
                    .collect(),
                (Some(candidate), _) => vec![candidate.to_string()],
                (None, _) => Vec::new(),
            },
            SelectionOutput::Names(names) => match (scope, self.target) {
                // bare column names are relative to the table the call was about
                (Some(table), SelectionTarget::Columns) => names
                    .into_iter()
                    .map(|n| if n.contains('.') { n } else { format!("{}.{}", table, n) })
                    .collect(),
                _ => names,
            },
        }
    }

    pub async fn select(
        &self,
        llm: &dyn TextGenerator,
        registry: &PromptRegistry,
        view: &SchemaView,
        question: &str,
    ) -> Result<SelectionResult> {
        let stage = self.target.stage_name();
        let available = self.available(view);
        info!("[{}] {} candidates available", stage, available.len());

        let mut intermediate_steps = Vec::new();
        let mut returned = Vec::new();

        if available.is_empty() {
            warn!("[{}] nothing to select from", stage);
        } else {
            for (scope, vars) in self.calls(view, question, &available) {
                let (step, output) = run_prompt(
                    llm,
                    registry,
                    &self.spec,
                    &view.dialect,
                    &vars,
                    stage,
                    scope.clone(),
                )
                .await?;
                intermediate_steps.push(step);
                if let Some(output) = output {
                    returned.extend(self.returned_names(view, scope.as_deref(), output));
                }
            }
        }

        let selected = match_available(&available, &returned);
        if selected.is_empty() {
            warn!("[{}] no candidates selected", stage);
        } else {
            info!("[{}] selected: {}", stage, selected.join(", "));
        }

        Ok(SelectionResult {
            target: self.target,
            available,
            selected,
            intermediate_steps,
        })
    }
}
