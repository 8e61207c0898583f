use crate::config::AppConfig;
use crate::db::schema_manager::SchemaCache;
use crate::pipeline::LinearExecutor;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub cache: SchemaCache,
    pub pipeline: LinearExecutor,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, cache: SchemaCache, pipeline: LinearExecutor) -> Self {
        Self {
            config,
            cache,
            pipeline,
            startup_time: chrono::Utc::now(),
        }
    }

    /// Describes every configured database up front. Failures are logged and
    /// the database is described again on first use.
    pub async fn warm_cache(&self) {
        for name in self.cache.names() {
            if let Err(e) = self.cache.refresh(&name).await {
                tracing::error!("Failed to describe database {}: {}", name, e);
            }
        }
    }
}
