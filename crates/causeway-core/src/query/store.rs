//! Predication store capability
//!
//! The engine only ever talks to a [`PredicationStore`]; the Postgres and
//! in-memory implementations both evaluate the same [`PredicationQuery`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

use super::builder::PredicationQuery;
use crate::error::Error;

/// Store failures, split by blast radius
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store itself cannot be reached; fatal once retries are exhausted
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// One statement failed; only its sub-batch is affected
    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Error::StoreUnavailable(msg),
            StoreError::Query(msg) => Error::QueryFailed(msg),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// One aggregated `(subject, object)` row returned by a predication query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PredicationRow {
    pub subject_cui: String,
    pub subject_name: String,
    pub predicate: String,
    pub object_cui: String,
    pub object_name: String,
    pub evidence_count: i64,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// Read-only source of subject–predicate–object assertions
#[async_trait]
pub trait PredicationStore: Send + Sync {
    /// Execute one predication query
    async fn fetch(&self, query: &PredicationQuery) -> Result<Vec<PredicationRow>, StoreError>;

    /// Upper bound on concurrent statements this store accepts
    fn max_connections(&self) -> usize;

    /// Short label for logs and metrics
    fn name(&self) -> &str;

    /// Identity of the data served, part of the cache key
    fn source(&self) -> String {
        self.name().to_string()
    }
}
