//! SQL Server access.
//!
//! Submodules:
//! - `config`: connection settings and server address parsing
//! - `client`: raw TDS client creation and the pool manager
//! - `params`: positional parameter values
//! - `query`: statement classification and result conversion

pub mod client;
pub mod config;
pub mod params;
pub mod query;

pub use client::{TdsClient, TdsConnectionManager};
pub use config::{DatabaseConfig, ServerAddress};
pub use params::SqlParam;
pub use query::{QueryOutput, StatementKind, column_to_json};

use std::time::Duration;

use bb8::{Pool, RunError};
use tiberius::ToSql;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: tiberius::error::Error,
    },
    #[error("Database connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("Query failed: {source}")]
    Query { source: tiberius::error::Error },
}

pub type DbPool = Pool<TdsConnectionManager>;

const CONNECT_ATTEMPTS: u32 = 5;

/// Lazily pooled connection to one SQL Server database.
///
/// Statements run in autocommit mode; there is no explicit transaction API.
pub struct DatabaseConnection {
    config: DatabaseConfig,
    pool: Mutex<Option<DbPool>>,
}

impl DatabaseConnection {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    fn timeout_ms(&self) -> u64 {
        self.config.acquire_timeout.as_millis() as u64
    }

    /// Returns the connection pool, creating it on first use.
    ///
    /// The first call opens one connection to verify the settings, retrying
    /// with exponential backoff. Later calls return the same pool until
    /// [`DatabaseConnection::close`] is called.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use biztools::db::{DatabaseConfig, DatabaseConnection};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = DatabaseConfig::new(
    ///         "ODBC Driver 18 for SQL Server",
    ///         "localhost,1433",
    ///         "sales",
    ///         "sa",
    ///         "password",
    ///     );
    ///     let db = DatabaseConnection::new(config);
    ///     db.connect().await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(&self) -> Result<DbPool, DatabaseError> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }

        let manager = TdsConnectionManager::new(
            self.config.tds_config()?,
            self.config.uses_named_instance(),
        );
        let pool = Pool::builder()
            .max_size(self.config.max_connections.max(1))
            .connection_timeout(self.config.acquire_timeout)
            .idle_timeout(Some(Duration::from_secs(600)))
            .max_lifetime(Some(Duration::from_secs(1800)))
            .build_unchecked(manager);

        let mut retry_delay = Duration::from_millis(100);
        for attempt in 1..=CONNECT_ATTEMPTS {
            match pool.get().await {
                Ok(_) => {
                    log::info!(
                        "Connected to {} (attempt {})",
                        self.config.redacted_connection_string(),
                        attempt
                    );
                    break;
                }
                Err(e) if attempt == CONNECT_ATTEMPTS => {
                    log::error!(
                        "Failed to connect to database after {} attempts: {}",
                        CONNECT_ATTEMPTS,
                        e
                    );
                    return Err(self.pool_error(e));
                }
                Err(e) => {
                    log::warn!(
                        "Database connection attempt {} failed: {}, retrying in {:?}",
                        attempt,
                        e,
                        retry_delay
                    );
                    sleep(retry_delay).await;
                    retry_delay *= 2;
                }
            }
        }

        *slot = Some(pool.clone());
        Ok(pool)
    }

    fn pool_error(&self, err: RunError<tiberius::error::Error>) -> DatabaseError {
        match err {
            RunError::User(source) => DatabaseError::ConnectionFailed { source },
            RunError::TimedOut => DatabaseError::ConnectionTimeout {
                timeout_ms: self.timeout_ms(),
            },
        }
    }

    /// Run one statement with positional parameters (`@P1`, `@P2`, ...).
    ///
    /// Row-returning statements yield [`QueryOutput::Rows`], or
    /// [`QueryOutput::Records`] when `as_dict` is set; anything else yields
    /// [`QueryOutput::RowsAffected`]. Failures are logged and returned.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlParam],
        as_dict: bool,
    ) -> Result<QueryOutput, DatabaseError> {
        let result = self.run(sql, params, as_dict).await;
        if let Err(e) = &result {
            log::error!("Error while executing query: {}", e);
        }
        result
    }

    async fn run(
        &self,
        sql: &str,
        params: &[SqlParam],
        as_dict: bool,
    ) -> Result<QueryOutput, DatabaseError> {
        let pool = self.connect().await?;
        let mut conn = pool.get().await.map_err(|e| self.pool_error(e))?;
        let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

        match StatementKind::classify(sql) {
            StatementKind::RowReturning => {
                let mut stream = conn
                    .query(sql, &bound)
                    .await
                    .map_err(|source| DatabaseError::Query { source })?;
                let columns: Vec<String> = stream
                    .columns()
                    .await
                    .map_err(|source| DatabaseError::Query { source })?
                    .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();
                let rows = stream
                    .into_first_result()
                    .await
                    .map_err(|source| DatabaseError::Query { source })?;
                log::debug!("Query returned {} rows", rows.len());
                Ok(query::build_output(&columns, rows, as_dict))
            }
            StatementKind::RowCount => {
                let result = conn
                    .execute(sql, &bound)
                    .await
                    .map_err(|source| DatabaseError::Query { source })?;
                Ok(QueryOutput::RowsAffected(result.total()))
            }
        }
    }

    /// Drop the pool. Safe to call repeatedly; a later query reconnects.
    pub async fn close(&self) {
        if self.pool.lock().await.take().is_some() {
            log::info!("Closed database pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> DatabaseConfig {
        let mut config = DatabaseConfig::new(
            "ODBC Driver 18 for SQL Server",
            "",
            "sales",
            "sa",
            "password",
        );
        config.acquire_timeout = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_invalid_server_fails_before_pooling() {
        let db = DatabaseConnection::new(unreachable_config());
        let result = db.execute_query("SELECT 1", &[], false).await;
        assert!(matches!(
            result,
            Err(DatabaseError::InvalidConfiguration { .. })
        ));
        assert!(!db.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = DatabaseConnection::new(unreachable_config());
        db.close().await;
        db.close().await;
        assert!(!db.is_connected().await);
    }
}
