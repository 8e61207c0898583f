pub mod db_pool;
pub mod executor;
pub mod introspect;
pub mod schema_manager;

use std::sync::Arc;

use crate::error::Result;
use crate::schema::entity::{EntitySelector, FilterMode};
use crate::schema::view::SchemaView;
use executor::{ExecutionError, QueryOutput, SqlExecutor};

/// A schema view paired with the executor for the database it describes.
#[derive(Clone)]
pub struct Database {
    pub view: SchemaView,
    pub executor: Arc<dyn SqlExecutor>,
}

impl Database {
    pub fn new(view: SchemaView, executor: Arc<dyn SqlExecutor>) -> Self {
        Self { view, executor }
    }

    pub fn name(&self) -> &str {
        &self.view.name
    }

    pub fn dialect(&self) -> &str {
        &self.view.dialect
    }

    /// Same database, narrower view.
    pub fn filter(&self, selectors: &[EntitySelector], mode: FilterMode) -> Result<Database> {
        Ok(Self {
            view: self.view.filter(selectors, mode)?,
            executor: Arc::clone(&self.executor),
        })
    }

    pub async fn execute(&self, sql: &str) -> std::result::Result<QueryOutput, ExecutionError> {
        self.executor.execute(sql).await
    }
}
