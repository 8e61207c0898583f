use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::executor::QueryOutput;
use crate::error::Nl2SqlError;
use crate::pipeline::PipelineResult;
use crate::schema::descriptor::SchemaDescriptor;
use crate::web::state::AppState;

// Query types

#[derive(Debug, Deserialize, Clone)]
pub struct NlQueryRequest {
    pub database: String,
    pub question: String,
    /// Also run the final query and return its rows
    #[serde(default)]
    pub execute: bool,
}

#[derive(Debug, Serialize)]
pub struct NlQueryResponse {
    pub result: PipelineResult,
    pub rows: Option<QueryOutput>,
    pub execution_error: Option<String>,
}

// Schema types

#[derive(Debug, Serialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub dialect: String,
    pub tables: Vec<String>,
    pub descriptor: SchemaDescriptor,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub name: String,
    pub table_count: usize,
    pub refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub database_count: usize,
    pub llm_backend: String,
    pub executor_id: String,
    pub last_schema_refresh: Option<chrono::DateTime<chrono::Utc>>,
}

/// Maps a pipeline error onto the HTTP status the caller should see.
pub fn error_response(e: Nl2SqlError) -> (StatusCode, String) {
    let status = match &e {
        Nl2SqlError::Validation(_) | Nl2SqlError::Execution(_) => StatusCode::BAD_REQUEST,
        Nl2SqlError::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Nl2SqlError::Llm(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (status, e.to_string())
}

fn ensure_known(state: &AppState, name: &str) -> Result<(), (StatusCode, String)> {
    if state.cache.names().iter().any(|n| n == name) {
        Ok(())
    } else {
        Err((StatusCode::NOT_FOUND, format!("Database '{}' not found", name)))
    }
}

// API Implementations

// Natural language query
pub async fn nl_query(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> Result<Json<NlQueryResponse>, (StatusCode, String)> {
    debug!("NL-query on {}: {}", payload.database, payload.question);

    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question must not be empty".to_string()));
    }
    ensure_known(&app_state, &payload.database)?;

    let database = app_state
        .cache
        .get(&payload.database)
        .await
        .map_err(error_response)?;

    let result = app_state
        .pipeline
        .run(&database, &payload.question)
        .await
        .map_err(error_response)?;

    let mut rows = None;
    let mut execution_error = None;
    if payload.execute {
        match result.generated_query.as_deref() {
            Some(sql) => match database.execute(sql).await {
                Ok(output) => {
                    info!("Query returned {} rows in {}ms", output.row_count, output.execution_time_ms);
                    rows = Some(output);
                }
                Err(e) => {
                    warn!("Final query failed: {}", e);
                    execution_error = Some(e.message);
                }
            },
            None => execution_error = Some("No query was generated".to_string()),
        }
    }

    Ok(Json(NlQueryResponse {
        result,
        rows,
        execution_error,
    }))
}

// Databases
pub async fn list_databases(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.cache.names())
}

// Schema
pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<DatabaseSchema>, (StatusCode, String)> {
    ensure_known(&state, &name)?;
    let database = state.cache.get(&name).await.map_err(error_response)?;

    Ok(Json(DatabaseSchema {
        name: database.name().to_string(),
        dialect: database.dialect().to_string(),
        tables: database.view.usable_tables(),
        descriptor: database.view.descriptor().clone(),
    }))
}

pub async fn refresh_schema(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    ensure_known(&state, &name)?;
    let database = state.cache.refresh(&name).await.map_err(error_response)?;

    Ok(Json(RefreshResponse {
        name,
        table_count: database.view.usable_tables().len(),
        refreshed_at: state.cache.last_refresh().await,
    }))
}

// System status
pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        database_count: state.cache.names().len(),
        llm_backend: state.config.llm.backend.clone(),
        executor_id: state.pipeline.executor_id().to_string(),
        last_schema_refresh: state.cache.last_refresh().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DatabaseConfig};
    use crate::db::schema_manager::SchemaCache;
    use crate::pipeline::LinearExecutor;
    use crate::prompts::PromptRegistry;
    use crate::schema::descriptor::tests::FakeIntrospector;
    use crate::tasks::generation::GenerationStage;
    use crate::tasks::tests::{FakeExecutor, ScriptedLlm};

    fn state(responses: &[&str]) -> Arc<AppState> {
        let mut cache = SchemaCache::new(10);
        cache.register(
            DatabaseConfig {
                name: "shop".to_string(),
                path: "unused.duckdb".to_string(),
                pool_size: 1,
                exclude: vec!["shop.users.ssn".to_string()],
                data_dictionary: None,
            },
            Arc::new(FakeIntrospector::new()),
            Arc::new(FakeExecutor::new("duckdb", &["FROM orders"])),
        );
        let pipeline = LinearExecutor::new(
            Arc::new(ScriptedLlm::new(responses)),
            Arc::new(PromptRegistry::new().unwrap()),
            GenerationStage::zero_shot(10),
        );
        Arc::new(AppState::new(AppConfig::default(), cache, pipeline))
    }

    fn request(database: &str, execute: bool) -> Json<NlQueryRequest> {
        Json(NlQueryRequest {
            database: database.to_string(),
            question: "how many orders?".to_string(),
            execute,
        })
    }

    #[tokio::test]
    async fn test_nl_query_with_execution() {
        let state = state(&["{\"thoughts\": \"t\", \"query\": \"```sql SELECT COUNT(*) FROM orders```\"}"]);

        let Json(response) = nl_query(State(state), request("shop", true)).await.unwrap();

        assert_eq!(response.result.generated_query.as_deref(), Some("SELECT COUNT(*) FROM orders"));
        assert_eq!(response.rows.unwrap().row_count, 1);
        assert!(response.execution_error.is_none());
    }

    #[tokio::test]
    async fn test_nl_query_reports_execution_failure() {
        let state = state(&["{\"thoughts\": \"t\", \"query\": \"SELECT 1\"}"]);

        let Json(response) = nl_query(State(state), request("shop", true)).await.unwrap();

        assert!(response.rows.is_none());
        assert!(response.execution_error.unwrap().contains("syntax error"));
    }

    #[tokio::test]
    async fn test_unknown_database_is_not_found() {
        let state = state(&[]);
        let err = nl_query(State(state.clone()), request("nope", false)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = get_schema(State(state), Path("nope".to_string())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_hides_excluded_columns() {
        let state = state(&[]);

        let Json(schema) = get_schema(State(state.clone()), Path("shop".to_string())).await.unwrap();
        assert_eq!(schema.tables, vec!["orders", "users"]);
        assert!(schema.descriptor.table("users").unwrap().column("ssn").is_none());

        let Json(refreshed) = refresh_schema(State(state.clone()), Path("shop".to_string())).await.unwrap();
        assert_eq!(refreshed.table_count, 2);
        assert!(refreshed.refreshed_at.is_some());

        let Json(status) = system_status(State(state.clone())).await;
        assert_eq!(status.database_count, 1);
        assert_eq!(status.llm_backend, "ollama");
        assert_eq!(status.executor_id, state.pipeline.executor_id());

        assert_eq!(list_databases(State(state)).await.0, vec!["shop"]);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            error_response(Nl2SqlError::Validation("bad".to_string())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(Nl2SqlError::Configuration("bad".to_string())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
