//! Linear NL→SQL executor: optional table, column and join selection, then
//! generation, optional execution-guided repair and fence cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::error::Result;
use crate::llm::TextGenerator;
use crate::prompts::PromptRegistry;
use crate::reporting::{ArtifactSink, record_artifact};
use crate::schema::entity::{EntitySelector, FilterMode};
use crate::tasks::IntermediateStep;
use crate::tasks::generation::SqlGenerator;
use crate::tasks::repair::QueryRepairer;
use crate::tasks::selection::{SelectionResult, SelectionStage};

const ARTIFACT_KEY: &str = "linear_executor";

static FENCE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```(?:sql\w*)?").unwrap());

/// Removes markdown code fences (and a whole `sql`, `sqlite`, ... tag right
/// after one) and trims.
pub fn strip_code_fences(query: &str) -> String {
    FENCE_REGEX.replace_all(query, "").trim().to_string()
}

/// Splits `table.column` at its last dot, so dotted table names stay whole.
fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.rsplit_once('.')
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSteps {
    pub stage: String,
    pub steps: Vec<IntermediateStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub original_query: String,
    pub final_query: String,
    pub succeeded: bool,
    pub trials: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub executor_id: String,
    pub result_id: String,
    pub db_name: String,
    pub question: String,
    pub available_tables: Option<Vec<String>>,
    pub selected_tables: Option<Vec<String>>,
    pub available_columns: Option<Vec<String>>,
    pub selected_columns: Option<Vec<String>>,
    pub available_joins: Option<Vec<String>>,
    pub selected_joins: Option<Vec<String>>,
    pub generated_query: Option<String>,
    pub repair: Option<RepairSummary>,
    pub intermediate_steps: Vec<StageSteps>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct LinearExecutor {
    executor_id: String,
    llm: Arc<dyn TextGenerator>,
    registry: Arc<PromptRegistry>,
    pub table_selection: Option<SelectionStage>,
    pub column_selection: Option<SelectionStage>,
    pub join_selection: Option<SelectionStage>,
    pub generation: SqlGenerator,
    pub repair: Option<QueryRepairer>,
    sink: Option<Arc<dyn ArtifactSink>>,
}

impl LinearExecutor {
    pub fn new(
        llm: Arc<dyn TextGenerator>,
        registry: Arc<PromptRegistry>,
        generation: impl Into<SqlGenerator>,
    ) -> Self {
        Self {
            executor_id: Uuid::new_v4().to_string(),
            llm,
            registry,
            table_selection: None,
            column_selection: None,
            join_selection: None,
            generation: generation.into(),
            repair: None,
            sink: None,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        llm: Arc<dyn TextGenerator>,
        registry: Arc<PromptRegistry>,
        sink: Option<Arc<dyn ArtifactSink>>,
    ) -> Result<Self> {
        let mut executor = Self::new(
            llm,
            registry,
            SqlGenerator::by_name(
                &config.sql_generation,
                config.max_rows_limit,
                config.agent_max_iterations,
            )?,
        );
        executor.table_selection = SelectionStage::tables(&config.table_selection)?;
        executor.column_selection = SelectionStage::columns(&config.column_selection)?;
        executor.join_selection = SelectionStage::joins(&config.join_selection)?;
        executor.repair = config
            .repair
            .then(|| QueryRepairer::zero_shot(config.repair_attempts, config.max_rows_limit));
        executor.sink = sink;
        Ok(executor)
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    async fn select(
        &self,
        stage: &SelectionStage,
        db: &Database,
        question: &str,
        steps: &mut Vec<StageSteps>,
    ) -> Result<SelectionResult> {
        let mut result = stage
            .select(self.llm.as_ref(), &self.registry, &db.view, question)
            .await?;
        steps.push(StageSteps {
            stage: stage.target.stage_name().to_string(),
            steps: std::mem::take(&mut result.intermediate_steps),
        });
        Ok(result)
    }

    pub async fn run(&self, db: &Database, question: &str) -> Result<PipelineResult> {
        info!("[{}] running for {} on {}", ARTIFACT_KEY, question, db.name());

        let mut result = PipelineResult {
            executor_id: self.executor_id.clone(),
            result_id: Uuid::new_v4().to_string(),
            db_name: db.name().to_string(),
            question: question.to_string(),
            available_tables: None,
            selected_tables: None,
            available_columns: None,
            selected_columns: None,
            available_joins: None,
            selected_joins: None,
            generated_query: None,
            repair: None,
            intermediate_steps: Vec::new(),
            created_at: chrono::Utc::now(),
        };

        let mut db = db.clone();

        if let Some(stage) = &self.table_selection {
            let selection = self.select(stage, &db, question, &mut result.intermediate_steps).await?;
            if selection.selected.is_empty() {
                warn!("[{}] no tables selected, continuing with an empty view", ARTIFACT_KEY);
            }
            let selectors: Vec<EntitySelector> = selection
                .selected
                .iter()
                .map(|table| EntitySelector::table(db.name(), table))
                .collect();
            db = db.filter(&selectors, FilterMode::Only)?;
            result.available_tables = Some(selection.available);
            result.selected_tables = Some(selection.selected);
        }

        if let Some(stage) = &self.column_selection {
            let selection = self.select(stage, &db, question, &mut result.intermediate_steps).await?;
            if selection.selected.is_empty() {
                warn!("[{}] no columns selected, continuing with an empty view", ARTIFACT_KEY);
            }
            let selectors: Vec<EntitySelector> = selection
                .selected
                .iter()
                .filter_map(|qualified| split_qualified(qualified))
                .map(|(table, column)| EntitySelector::column(db.name(), table, column))
                .collect();
            db = db.filter(&selectors, FilterMode::Only)?;
            result.available_columns = Some(selection.available);
            result.selected_columns = Some(selection.selected);
        }

        let mut joins = Vec::new();
        if let Some(stage) = &self.join_selection {
            let selection = self.select(stage, &db, question, &mut result.intermediate_steps).await?;
            joins = selection.selected.clone();
            result.available_joins = Some(selection.available);
            result.selected_joins = Some(selection.selected);
        }

        let generation = self
            .generation
            .generate(self.llm.as_ref(), &self.registry, &db, question, &joins)
            .await?;
        result.intermediate_steps.push(StageSteps {
            stage: "sql_generation".to_string(),
            steps: generation.intermediate_steps,
        });
        let generated_query = generation.generated_query.map(|q| strip_code_fences(&q));
        let mut query = generated_query.clone();

        if let (Some(repairer), Some(generated)) = (&self.repair, generated_query.as_deref()) {
            match repairer
                .repair(self.llm.as_ref(), &self.registry, &db, question, generated)
                .await
            {
                Ok(outcome) => {
                    query = Some(outcome.final_query.clone());
                    result.intermediate_steps.push(StageSteps {
                        stage: "sql_repair".to_string(),
                        steps: outcome.intermediate_steps,
                    });
                    result.repair = Some(RepairSummary {
                        original_query: outcome.original_query,
                        final_query: outcome.final_query,
                        succeeded: outcome.succeeded,
                        trials: outcome.trials,
                    });
                }
                Err(e) => error!("[{}] repair failed, keeping generated query: {}", ARTIFACT_KEY, e),
            }
        } else if self.repair.is_some() {
            warn!("[{}] no query generated, skipping repair", ARTIFACT_KEY);
        }

        result.generated_query = query.map(|q| strip_code_fences(&q));
        match &result.generated_query {
            Some(q) => info!("[{}] final query: {}", ARTIFACT_KEY, q),
            None => warn!("[{}] finished without a query", ARTIFACT_KEY),
        }

        record_artifact(self.sink.as_deref(), ARTIFACT_KEY, &result.result_id, &result);
        Ok(result)
    }
}
