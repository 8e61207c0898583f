use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::llm::TextGenerator;
use crate::prompts::{PromptRegistry, PromptSpec};
use crate::tasks::generation::{query_parser, structured_query};
use crate::tasks::{IntermediateStep, run_prompt};

const STAGE: &str = "sql_repair";

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub question: String,
    pub original_query: String,
    pub final_query: String,
    pub succeeded: bool,
    /// Every query tried, in order. `trials[0]` is the original query.
    pub trials: Vec<String>,
    pub intermediate_steps: Vec<IntermediateStep>,
}

/// Execution-guided repair: run the query, and while it fails and attempts
/// remain, ask the model for a fixed version using the first error line.
pub struct QueryRepairer {
    pub spec: PromptSpec<Option<String>>,
    pub max_attempts: usize,
    pub top_k: usize,
}

impl QueryRepairer {
    pub fn new(spec: PromptSpec<Option<String>>, max_attempts: usize, top_k: usize) -> Self {
        Self {
            spec,
            max_attempts,
            top_k,
        }
    }

    pub fn zero_shot(max_attempts: usize, top_k: usize) -> Self {
        Self::new(
            PromptSpec::new("sql_repair_zero_shot", "sql_repair.j2", Some(query_parser()), structured_query),
            max_attempts,
            top_k,
        )
    }

    pub async fn repair(
        &self,
        llm: &dyn TextGenerator,
        registry: &PromptRegistry,
        db: &Database,
        question: &str,
        query: &str,
    ) -> Result<RepairOutcome> {
        let mut trials = vec![query.to_string()];
        let mut intermediate_steps = Vec::new();
        let mut attempt = 0;
        // error line of a query that has already been executed and not replaced
        let mut known_error: Option<String> = None;

        let succeeded = loop {
            let current = trials.last().map(String::as_str).unwrap_or(query);

            let error_line = match known_error.take() {
                Some(line) => line,
                None => match db.execute(current).await {
                    Ok(output) => {
                        debug!("[{}] trial {} returned {} rows", STAGE, trials.len() - 1, output.row_count);
                        break true;
                    }
                    Err(e) => e.first_line().to_string(),
                },
            };

            if attempt >= self.max_attempts {
                break false;
            }
            attempt += 1;
            warn!("[{}] trial {} failed: {}", STAGE, trials.len() - 1, error_line);

            let vars = json!({
                "question": question,
                "generated_query": current,
                "error_message": error_line,
                "dialect": db.dialect(),
                "top_k": self.top_k,
                "table_info": db.view.table_info(),
                "table_names": db.view.usable_tables(),
                "db_descriptor": db.view.descriptor(),
                "format_instructions": self.spec.format_instructions(),
            });

            let (step, output) = match run_prompt(
                llm,
                registry,
                &self.spec,
                db.dialect(),
                &vars,
                STAGE,
                Some(format!("trial_{}", attempt)),
            )
            .await
            {
                Ok(called) => called,
                Err(e) => {
                    error!(
                        "[{}] attempt {} aborted after {} recorded calls, trials so far: {:?}: {}",
                        STAGE,
                        attempt,
                        intermediate_steps.len(),
                        trials,
                        e
                    );
                    return Err(e);
                }
            };
            intermediate_steps.push(step);

            match output.flatten() {
                Some(fixed) => trials.push(fixed),
                None => known_error = Some(error_line),
            }
        };

        let final_query = trials.last().cloned().unwrap_or_else(|| query.to_string());
        if succeeded {
            info!("[{}] query executes after {} attempts", STAGE, attempt);
        } else {
            warn!("[{}] gave up after {} attempts", STAGE, attempt);
        }

        Ok(RepairOutcome {
            question: question.to_string(),
            original_query: query.to_string(),
            final_query,
            succeeded,
            trials,
            intermediate_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::executor::tests::temp_pool;
    use crate::db::executor::DuckDbExecutor;
    use crate::error::Nl2SqlError;
    use crate::schema::descriptor::tests::{FakeIntrospector, shop_catalog};
    use crate::schema::entity::EntitySet;
    use crate::schema::view::SchemaView;
    use crate::tasks::tests::{FakeExecutor, ScriptedLlm, SilentLlm};
    use std::sync::Arc;

    fn database(executor: Arc<FakeExecutor>) -> Database {
        let view = SchemaView::describe(
            Arc::new(shop_catalog()),
            "duckdb",
            &EntitySet::empty(),
            None,
            &FakeIntrospector::new(),
            10,
        )
        .unwrap();
        Database::new(view, executor)
    }

    fn fixed(query: &str) -> String {
        format!("{{\"thoughts\": \"fix\", \"query\": \"{}\"}}", query)
    }

    #[tokio::test]
    async fn test_valid_query_needs_no_llm() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &["SELECT 1"]));
        let llm = ScriptedLlm::new(&[]);
        let registry = PromptRegistry::new().unwrap();

        let outcome = QueryRepairer::zero_shot(3, 10)
            .repair(&llm, &registry, &database(executor.clone()), "q", "SELECT 1")
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.trials, vec!["SELECT 1"]);
        assert_eq!(outcome.final_query, "SELECT 1");
        assert_eq!(llm.calls(), 0);
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn test_repairs_until_success() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &["GOOD"]));
        let llm = ScriptedLlm::new(&[fixed("SELEC 2").as_str(), fixed("SELECT GOOD").as_str()]);
        let registry = PromptRegistry::new().unwrap();

        let outcome = QueryRepairer::zero_shot(5, 10)
            .repair(&llm, &registry, &database(executor.clone()), "q", "SELEC 1")
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.trials, vec!["SELEC 1", "SELEC 2", "SELECT GOOD"]);
        assert_eq!(outcome.final_query, "SELECT GOOD");
        assert_eq!(llm.calls(), 2);
        assert_eq!(executor.executions(), 3);

        let scopes: Vec<_> = outcome
            .intermediate_steps
            .iter()
            .map(|s| s.scope.clone().unwrap())
            .collect();
        assert_eq!(scopes, vec!["trial_1", "trial_2"]);

        // only the first line of the error reaches the prompt
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("Parser Error: syntax error in \"SELEC 1\""));
        assert!(!prompts[0].contains("LINE 1:"));
        assert!(prompts[1].contains("SELEC 2"));
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_an_error() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &[]));
        let llm = ScriptedLlm::new(&[fixed("BAD 2").as_str(), fixed("BAD 3").as_str()]);
        let registry = PromptRegistry::new().unwrap();

        let outcome = QueryRepairer::zero_shot(2, 10)
            .repair(&llm, &registry, &database(executor.clone()), "q", "BAD 1")
            .await
            .unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.trials.len(), 3);
        assert_eq!(outcome.final_query, outcome.trials[2]);
        assert_eq!(outcome.original_query, "BAD 1");
        assert_eq!(llm.calls(), 2);
        assert_eq!(executor.executions(), 3);
    }

    #[tokio::test]
    async fn test_history_is_append_only_and_bounded() {
        for max_attempts in 0..4 {
            let executor = Arc::new(FakeExecutor::new("duckdb", &[]));
            let llm = ScriptedLlm::new(&[fixed("BAD").as_str()]);
            let registry = PromptRegistry::new().unwrap();

            let outcome = QueryRepairer::zero_shot(max_attempts, 10)
                .repair(&llm, &registry, &database(executor.clone()), "q", "ORIGINAL")
                .await
                .unwrap();

            assert_eq!(outcome.trials.len(), max_attempts + 1);
            assert_eq!(outcome.trials[0], "ORIGINAL");
            assert!(llm.calls() <= max_attempts);
            assert!(executor.executions() <= max_attempts + 1);
        }
    }

    #[tokio::test]
    async fn test_malformed_response_consumes_attempt_without_reexecuting() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &["GOOD"]));
        let llm = ScriptedLlm::new(&["no json here", fixed("SELECT GOOD").as_str()]);
        let registry = PromptRegistry::new().unwrap();

        let outcome = QueryRepairer::zero_shot(3, 10)
            .repair(&llm, &registry, &database(executor.clone()), "q", "BAD")
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.trials, vec!["BAD", "SELECT GOOD"]);
        assert_eq!(outcome.intermediate_steps.len(), 2);
        assert!(outcome.intermediate_steps[0].error.is_some());
        assert_eq!(llm.calls(), 2);
        assert_eq!(executor.executions(), 2);

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts[0], prompts[1]);
    }

    #[tokio::test]
    async fn test_transport_failures_propagate() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &[]));
        let registry = PromptRegistry::new().unwrap();

        let result = QueryRepairer::zero_shot(3, 10)
            .repair(&SilentLlm, &registry, &database(executor), "q", "BAD")
            .await;
        assert!(matches!(result, Err(Nl2SqlError::Llm(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_after_a_fix_still_propagates() {
        let executor = Arc::new(FakeExecutor::new("duckdb", &[]));
        let llm = ScriptedLlm::then_silent(&[fixed("SELEC 2").as_str()]);
        let registry = PromptRegistry::new().unwrap();

        let result = QueryRepairer::zero_shot(3, 10)
            .repair(&llm, &registry, &database(executor.clone()), "q", "SELEC 1")
            .await;

        assert!(matches!(result, Err(Nl2SqlError::Llm(_))));
        assert_eq!(llm.calls(), 2);
        let statements = executor.statements.lock().unwrap();
        assert_eq!(*statements, vec!["SELEC 1", "SELEC 2"]);
    }

    #[tokio::test]
    async fn test_repair_against_duckdb() {
        let (pool, path) = temp_pool("CREATE TABLE orders (id INTEGER, total DOUBLE);");
        let view = SchemaView::describe(
            Arc::new(shop_catalog()),
            "duckdb",
            &EntitySet::empty(),
            None,
            &FakeIntrospector::new(),
            10,
        )
        .unwrap();
        let db = Database::new(view, Arc::new(DuckDbExecutor::new(pool, 10)));
        let llm = ScriptedLlm::new(&[fixed("SELECT SUM(total) FROM orders").as_str()]);
        let registry = PromptRegistry::new().unwrap();

        let outcome = QueryRepairer::zero_shot(2, 10)
            .repair(&llm, &registry, &db, "q", "SELECT SUM(amount) FROM orders")
            .await
            .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.trials.len(), 2);
        assert!(llm.prompts.lock().unwrap()[0].contains("amount"));

        let _ = std::fs::remove_file(path);
    }
}
