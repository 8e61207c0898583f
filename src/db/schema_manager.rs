use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::db::db_pool::build_pool;
use crate::db::executor::{DuckDbExecutor, SqlExecutor};
use crate::db::introspect::{DuckDbIntrospector, Introspector};
use crate::db::Database;
use crate::error::{Nl2SqlError, Result};
use crate::schema::descriptor::DataDictionary;
use crate::schema::entity::EntitySet;
use crate::schema::view::SchemaView;

/// Everything needed to (re)describe one configured database.
struct DatabaseSource {
    config: DatabaseConfig,
    introspector: Arc<dyn Introspector>,
    executor: Arc<dyn SqlExecutor>,
}

/// Caches one described [`Database`] per configured name.
///
/// Descriptions are computed lazily on first use and kept until
/// [`SchemaCache::refresh`] or [`SchemaCache::invalidate`] is called.
pub struct SchemaCache {
    sources: HashMap<String, DatabaseSource>,
    enum_limit: usize,
    cache: RwLock<HashMap<String, Arc<Database>>>,
    last_refresh: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl SchemaCache {
    /// Opens a pool per configured DuckDB database. Nothing is introspected yet.
    pub fn from_config(
        databases: &[DatabaseConfig],
        enum_limit: usize,
        max_rows: usize,
    ) -> Result<Self> {
        let mut cache = Self::new(enum_limit);
        for config in databases {
            info!("Opening database {} at {}", config.name, config.path);
            let pool = build_pool(config)?;
            let introspector = Arc::new(DuckDbIntrospector::new(&config.name, pool.clone()));
            let executor = Arc::new(DuckDbExecutor::new(pool, max_rows));
            cache.register(config.clone(), introspector, executor);
        }
        Ok(cache)
    }

    pub fn new(enum_limit: usize) -> Self {
        Self {
            sources: HashMap::new(),
            enum_limit,
            cache: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
        }
    }

    pub fn register(
        &mut self,
        config: DatabaseConfig,
        introspector: Arc<dyn Introspector>,
        executor: Arc<dyn SqlExecutor>,
    ) {
        self.sources.insert(
            config.name.clone(),
            DatabaseSource {
                config,
                introspector,
                executor,
            },
        );
    }

    /// Configured database names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn last_refresh(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.last_refresh.read().await
    }

    /// The cached database, describing it first when needed.
    pub async fn get(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(database) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(database));
        }
        self.refresh(name).await
    }

    /// Re-introspects `name` and replaces the cached entry.
    pub async fn refresh(&self, name: &str) -> Result<Arc<Database>> {
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| Nl2SqlError::Configuration(format!("Unknown database: {}", name)))?;

        info!("Refreshing schema cache for {}", name);

        let config = source.config.clone();
        let introspector = Arc::clone(&source.introspector);
        let dialect = source.executor.dialect().to_string();
        let enum_limit = self.enum_limit;

        let view = tokio::task::spawn_blocking(move || {
            describe_database(&config, introspector.as_ref(), &dialect, enum_limit)
        })
        .await
        .map_err(|join_err| {
            error!("Task join error: {}", join_err);
            Nl2SqlError::Configuration(format!("Schema task execution failed: {}", join_err))
        })??;

        let database = Arc::new(Database::new(view, Arc::clone(&source.executor)));

        self.cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&database));
        *self.last_refresh.write().await = Some(chrono::Utc::now());

        info!("Schema cache refreshed for {}", name);
        Ok(database)
    }

    /// Drops the cached entry; the next `get` describes the database again.
    pub async fn invalidate(&self, name: &str) {
        if self.cache.write().await.remove(name).is_some() {
            debug!("Invalidated schema cache for {}", name);
        }
    }
}

fn describe_database(
    config: &DatabaseConfig,
    introspector: &dyn Introspector,
    dialect: &str,
    enum_limit: usize,
) -> Result<SchemaView> {
    let catalog = Arc::new(introspector.catalog()?);

    let mut dataset = BTreeMap::new();
    dataset.insert(config.name.clone(), catalog.column_types());
    let exclusions = EntitySet::from_strings(config.exclude.as_slice(), &dataset)?;
    if !exclusions.is_empty() {
        debug!("[{}] : {} columns excluded by configuration", config.name, exclusions.len());
    }

    let dictionary = config
        .data_dictionary
        .as_deref()
        .map(DataDictionary::load)
        .transpose()?;

    SchemaView::describe(
        catalog,
        dialect,
        &exclusions,
        dictionary.as_ref(),
        introspector,
        enum_limit,
    )
}
