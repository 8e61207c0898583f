use duckdb::Connection;
use r2d2::{ManageConnection, Pool};
use std::sync::{Arc, Mutex};

use crate::config::DatabaseConfig;
use crate::error::{Nl2SqlError, Result};

pub type DuckDbPool = Pool<DuckDBConnectionManager>;

/// Hands out connections cloned from one opened database instance, so every
/// pooled connection sees the same file (or the same `:memory:` database).
pub struct DuckDBConnectionManager {
    base: Arc<Mutex<Connection>>,
}

impl DuckDBConnectionManager {
    pub fn new(path: &str) -> std::result::Result<Self, duckdb::Error> {
        let base = Connection::open(path)?;
        Ok(Self {
            base: Arc::new(Mutex::new(base)),
        })
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let base = self
            .base
            .lock()
            .map_err(|_| duckdb::Error::InvalidParameterName("poisoned connection lock".to_string()))?;
        base.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Builds the connection pool for one configured database.
pub fn build_pool(config: &DatabaseConfig) -> Result<DuckDbPool> {
    let open_error = |e: String| {
        Nl2SqlError::Configuration(format!(
            "Failed to open database {} at {}: {}",
            config.name, config.path, e
        ))
    };

    let manager = DuckDBConnectionManager::new(&config.path).map_err(|e| open_error(e.to_string()))?;

    Pool::builder()
        .max_size(config.pool_size.max(1) as u32)
        .build(manager)
        .map_err(|e| open_error(e.to_string()))
}
