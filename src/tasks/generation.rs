use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{Nl2SqlError, Result};
use crate::llm::TextGenerator;
use crate::prompts::definition::{raw_text, string_field};
use crate::prompts::{PromptRegistry, PromptSpec, StructuredParser};
use crate::db::Database;
use crate::schema::view::SchemaView;
use crate::tasks::react::ReactGenerator;
use crate::tasks::{IntermediateStep, run_prompt};

const STAGE: &str = "sql_generation";

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub question: String,
    pub generated_query: Option<String>,
    pub intermediate_steps: Vec<IntermediateStep>,
}

fn non_empty(query: &str) -> Option<String> {
    let query = query.trim();
    (!query.is_empty()).then(|| query.to_string())
}

/// Query part of a `SQLQuery: ... SQLResult: ...` completion.
pub fn extract_sql_query(text: &str) -> Option<String> {
    let after = text.rsplit("SQLQuery:").next().unwrap_or(text);
    let query = after.split("SQLResult:").next().unwrap_or(after);
    non_empty(query)
}

/// Parser shared by every prompt that answers with a single query.
pub fn query_parser() -> StructuredParser {
    StructuredParser::new(&[
        ("thoughts", "string // step by step reasoning behind the query"),
        ("query", "string // the SQL query, without code fences"),
    ])
}

pub fn structured_query(parsed: &Value) -> Result<Option<String>> {
    Ok(non_empty(&string_field(parsed, "query")?))
}

pub struct GenerationStage {
    pub spec: PromptSpec<Option<String>>,
    pub top_k: usize,
}

impl GenerationStage {
    pub fn new(spec: PromptSpec<Option<String>>, top_k: usize) -> Self {
        Self { spec, top_k }
    }

    /// Structured `{thoughts, query}` answer.
    pub fn zero_shot(top_k: usize) -> Self {
        Self::new(
            PromptSpec::new(
                "sql_generation_zero_shot",
                "sql_generation.j2",
                Some(query_parser()),
                structured_query,
            ),
            top_k,
        )
    }

    /// Structured answer after two worked examples.
    pub fn few_shot_cot(top_k: usize) -> Self {
        Self::new(
            PromptSpec::new(
                "sql_generation_few_shot_cot",
                "sql_generation_cot.j2",
                Some(query_parser()),
                structured_query,
            ),
            top_k,
        )
    }

    /// Plain-text completion in the `SQLQuery:` / `SQLResult:` format.
    pub fn raw_zero_shot(top_k: usize) -> Self {
        Self::new(
            PromptSpec::new("sql_generation_raw", "sql_generation_raw.j2", None, |v| {
                Ok(extract_sql_query(&raw_text(v)?))
            })
            .with_dialect("duckdb", "sql_generation_raw_duckdb.j2"),
            top_k,
        )
    }

    pub fn by_name(variant: &str, top_k: usize) -> Result<Self> {
        match variant {
            "zero_shot" => Ok(Self::zero_shot(top_k)),
            "few_shot" => Ok(Self::few_shot_cot(top_k)),
            "raw" => Ok(Self::raw_zero_shot(top_k)),
            other => Err(Nl2SqlError::Configuration(format!(
                "Unknown SQL generation variant: {}",
                other
            ))),
        }
    }

    /// Single call; `joins` are hinted to the model when non-empty.
    pub async fn generate(
        &self,
        llm: &dyn TextGenerator,
        registry: &PromptRegistry,
        view: &SchemaView,
        question: &str,
        joins: &[String],
    ) -> Result<GenerationResult> {
        let vars = json!({
            "question": question,
            "joins": joins,
            "dialect": view.dialect,
            "top_k": self.top_k,
            "table_info": view.table_info(),
            "table_names": view.usable_tables().join(", "),
            "format_instructions": self.spec.format_instructions(),
        });

        let (step, output) =
            run_prompt(llm, registry, &self.spec, &view.dialect, &vars, STAGE, None).await?;
        let generated_query = output.flatten();

        match &generated_query {
            Some(query) => info!("[{}] generated: {}", STAGE, query),
            None => warn!("[{}] no query could be extracted", STAGE),
        }

        Ok(GenerationResult {
            question: question.to_string(),
            generated_query,
            intermediate_steps: vec![step],
        })
    }
}

/// Either a single prompted call or the tool-using agent.
pub enum SqlGenerator {
    Prompted(GenerationStage),
    Agent(ReactGenerator),
}

impl From<GenerationStage> for SqlGenerator {
    fn from(stage: GenerationStage) -> Self {
        SqlGenerator::Prompted(stage)
    }
}

impl SqlGenerator {
    pub fn by_name(variant: &str, top_k: usize, max_iterations: usize) -> Result<Self> {
        match variant {
            "react" => Ok(SqlGenerator::Agent(ReactGenerator::new(top_k, max_iterations))),
            other => GenerationStage::by_name(other, top_k).map(SqlGenerator::Prompted),
        }
    }

    /// The agent ignores join hints; it finds its own joins through the schema tool.
    pub async fn generate(
        &self,
        llm: &dyn TextGenerator,
        registry: &PromptRegistry,
        db: &Database,
        question: &str,
        joins: &[String],
    ) -> Result<GenerationResult> {
        match self {
            SqlGenerator::Prompted(stage) => {
                stage
                    .generate(llm, registry, &db.view, question, joins)
                    .await
            }
            SqlGenerator::Agent(agent) => agent.generate(llm, registry, db, question).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::descriptor::tests::{FakeIntrospector, shop_catalog};
    use crate::schema::entity::EntitySet;
    use crate::tasks::tests::{FakeExecutor, ScriptedLlm};
    use std::sync::Arc;

    fn view(dialect: &str) -> SchemaView {
        SchemaView::describe(
            Arc::new(shop_catalog()),
            dialect,
            &EntitySet::empty(),
            None,
            &FakeIntrospector::new(),
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_extract_sql_query() {
        assert_eq!(
            extract_sql_query(" SELECT 1\nSQLResult: 1\nAnswer: one").as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(
            extract_sql_query("Question: q\nSQLQuery: SELECT 2 SQLResult:").as_deref(),
            Some("SELECT 2")
        );
        assert_eq!(extract_sql_query("SQLQuery:   "), None);
    }

    #[tokio::test]
    async fn test_zero_shot_generation() {
        let registry = PromptRegistry::new().unwrap();
        let llm = ScriptedLlm::new(&[
            "```json\n{\"thoughts\": \"sum totals\", \"query\": \"SELECT SUM(total) FROM orders\"}\n```",
        ]);

        let result = GenerationStage::zero_shot(50)
            .generate(&llm, &registry, &view("duckdb"), "total revenue?", &[])
            .await
            .unwrap();

        assert_eq!(result.generated_query.as_deref(), Some("SELECT SUM(total) FROM orders"));
        assert_eq!(result.intermediate_steps.len(), 1);
        let prompt = &llm.prompts.lock().unwrap()[0];
        assert!(prompt.contains("at most 50 results"));
        assert!(prompt.contains("CREATE TABLE orders"));
    }

    #[tokio::test]
    async fn test_unparseable_output_is_not_an_error() {
        let registry = PromptRegistry::new().unwrap();
        for response in ["I cannot answer that", "{\"thoughts\": \"x\", \"query\": \"  \"}"] {
            let llm = ScriptedLlm::new(&[response]);
            let result = GenerationStage::zero_shot(10)
                .generate(&llm, &registry, &view("duckdb"), "q", &[])
                .await
                .unwrap();
            assert!(result.generated_query.is_none());
            assert_eq!(result.intermediate_steps.len(), 1);
            assert_eq!(llm.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_dialect_falls_back_to_default_template() {
        let registry = PromptRegistry::new().unwrap();

        let llm = ScriptedLlm::new(&["SELECT 1\nSQLResult: 1"]);
        let result = GenerationStage::raw_zero_shot(10)
            .generate(&llm, &registry, &view("postgres"), "q", &[])
            .await
            .unwrap();
        assert_eq!(result.generated_query.as_deref(), Some("SELECT 1"));
        assert!(!llm.prompts.lock().unwrap()[0].contains("DuckDB expert"));

        let llm = ScriptedLlm::new(&["SELECT 1"]);
        GenerationStage::raw_zero_shot(10)
            .generate(&llm, &registry, &view("duckdb"), "q", &[])
            .await
            .unwrap();
        assert!(llm.prompts.lock().unwrap()[0].contains("DuckDB expert"));
    }

    #[tokio::test]
    async fn test_missing_template_is_configuration_error() {
        let registry = PromptRegistry::new().unwrap();
        let mut stage = GenerationStage::zero_shot(10);
        stage.spec.templates.clear();
        stage
            .spec
            .templates
            .insert("sqlite".to_string(), "sql_generation.j2".to_string());

        let llm = ScriptedLlm::new(&["SELECT 1"]);
        let result = stage.generate(&llm, &registry, &view("postgres"), "q", &[]).await;
        assert!(matches!(result, Err(Nl2SqlError::Configuration(_))));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_few_shot_generation_shows_examples_before_schema() {
        let registry = PromptRegistry::new().unwrap();
        let llm = ScriptedLlm::new(&["{\"thoughts\": \"count rows\", \"query\": \"SELECT COUNT(*) FROM users\"}"]);

        let result = GenerationStage::by_name("few_shot", 5)
            .unwrap()
            .generate(
                &llm,
                &registry,
                &view("duckdb"),
                "how many users?",
                &["orders.user_id=users.id".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(result.generated_query.as_deref(), Some("SELECT COUNT(*) FROM users"));
        assert_eq!(result.intermediate_steps[0].prompt_id, "sql_generation_few_shot_cot");
        let prompt = &llm.prompts.lock().unwrap()[0];
        let example = prompt.find("Example 1").unwrap();
        assert!(example < prompt.find("CREATE TABLE users").unwrap());
        assert!(prompt.contains("- orders.user_id=users.id"));
    }

    #[tokio::test]
    async fn test_generator_names() {
        assert!(matches!(
            SqlGenerator::by_name("react", 10, 4),
            Ok(SqlGenerator::Agent(ReactGenerator { max_iterations: 4, .. }))
        ));
        assert!(matches!(
            SqlGenerator::by_name("few_shot", 10, 4),
            Ok(SqlGenerator::Prompted(_))
        ));
        assert!(matches!(
            SqlGenerator::by_name("chain_of_thought", 10, 4),
            Err(Nl2SqlError::Configuration(_))
        ));

        let db = Database::new(view("duckdb"), Arc::new(FakeExecutor::new("duckdb", &[])));
        let llm = ScriptedLlm::new(&["{\"thoughts\": \"t\", \"query\": \"SELECT 1\"}"]);
        let result = SqlGenerator::from(GenerationStage::zero_shot(10))
            .generate(&llm, &PromptRegistry::new().unwrap(), &db, "q", &[])
            .await
            .unwrap();
        assert_eq!(result.generated_query.as_deref(), Some("SELECT 1"));
    }
}
