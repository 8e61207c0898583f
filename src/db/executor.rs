use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use duckdb::Connection;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error};

use crate::db::db_pool::DuckDbPool;

/// A failed statement. `message` is the database's own error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// First line of the message; the rest is usually a caret diagram or a hint.
    pub fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution error: {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Dialect tag used to pick prompt templates.
    fn dialect(&self) -> &str;

    async fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutionError>;
}

pub struct DuckDbExecutor {
    pool: DuckDbPool,
    max_rows: usize,
}

impl DuckDbExecutor {
    pub fn new(pool: DuckDbPool, max_rows: usize) -> Self {
        Self { pool, max_rows }
    }
}

fn run_query(pool: &DuckDbPool, sql: &str, max_rows: usize) -> Result<QueryOutput, ExecutionError> {
    let conn = pool
        .get()
        .map_err(|e| ExecutionError::new(format!("Failed to get connection: {}", e)))?;

    query_rows(&conn, sql, max_rows)
}

/// Runs `sql` and renders at most `max_rows` rows as display strings.
pub(crate) fn query_rows(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
) -> Result<QueryOutput, ExecutionError> {
    let start_time = Instant::now();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ExecutionError::new(e.to_string()))?;

    let arrow_batch = stmt
        .query_arrow([])
        .map_err(|e| ExecutionError::new(e.to_string()))?;

    let schema = arrow_batch.get_schema();
    let columns = schema
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect::<Vec<String>>();

    let record_batches = arrow_batch.collect::<Vec<_>>();
    let row_count: usize = record_batches.iter().map(|batch| batch.num_rows()).sum();

    let mut rows = Vec::with_capacity(row_count.min(max_rows));
    'batches: for batch in &record_batches {
        for row in 0..batch.num_rows() {
            if rows.len() >= max_rows {
                break 'batches;
            }
            let values = batch
                .columns()
                .iter()
                .map(|array| array_value_to_string(array, row))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ExecutionError::new(e.to_string()))?;
            rows.push(values);
        }
    }

    Ok(QueryOutput {
        columns,
        truncated: rows.len() < row_count,
        rows,
        row_count,
        execution_time_ms: start_time.elapsed().as_millis() as u64,
    })
}

#[async_trait]
impl SqlExecutor for DuckDbExecutor {
    fn dialect(&self) -> &str {
        "duckdb"
    }

    async fn execute(&self, sql: &str) -> Result<QueryOutput, ExecutionError> {
        debug!("Executing SQL: {}", sql);

        let pool = self.pool.clone();
        let sql = sql.to_string();
        let max_rows = self.max_rows;

        let blocking_task = tokio::task::spawn_blocking(move || run_query(&pool, &sql, max_rows));

        match blocking_task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!("Task join error: {}", join_err);
                Err(ExecutionError::new(format!(
                    "Database task execution failed: {}",
                    join_err
                )))
            }
        }
    }
}
