//! Postgres-backed predication store
//!
//! Provides connection pool management for the predication database. The
//! pool size is the hard cap on concurrent statements issued by expansion.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

use super::builder::{PredicationQuery, QueryParam};
use super::store::{PredicationRow, PredicationStore, StoreError};
use crate::config::DatabaseConfig;
use crate::error::Result;

/// Predication store backed by a bounded Postgres pool
#[derive(Debug, Clone)]
pub struct PgPredicationStore {
    pool: PgPool,
    max_connections: usize,
    label: String,
}

impl PgPredicationStore {
    /// Connect using the given descriptor; the password comes from the environment
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database);
        if let Some(password) = config.resolved_password()? {
            options = options.password(&password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await
            .map_err(StoreError::from)?;

        let label = Self::source_for(config);
        info!(store = %label, max_connections = config.max_connections, "Predication store connected");

        Ok(Self {
            pool,
            max_connections: config.max_connections as usize,
            label,
        })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, max_connections: usize) -> Self {
        Self {
            pool,
            max_connections,
            label: "postgres".to_string(),
        }
    }

    /// Identity of the database a store connected with `config` reads
    pub fn source_for(config: &DatabaseConfig) -> String {
        format!("postgres://{}:{}/{}", config.host, config.port, config.database)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PredicationStore for PgPredicationStore {
    async fn fetch(&self, query: &PredicationQuery) -> std::result::Result<Vec<PredicationRow>, StoreError> {
        query
            .check_binding_order()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!(
            scope = ?query.scope,
            frontier = query.frontier().len(),
            "Executing predication query"
        );

        let mut statement = sqlx::query_as::<_, PredicationRow>(&query.sql);
        for param in &query.params {
            statement = match param {
                QueryParam::TextArray(values) => statement.bind(values.clone()),
                QueryParam::BigInt(value) => statement.bind(*value),
            };
        }

        let rows = statement.fetch_all(&self.pool).await?;
        Ok(rows)
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn name(&self) -> &str {
        &self.label
    }
}
