//! Parameterized predication queries
//!
//! Every query binds its parameters in one fixed order:
//!
//! | position | placeholder | type     | content                    |
//! |----------|-------------|----------|----------------------------|
//! | 1        | `$1`        | `TEXT[]` | causal predicate labels    |
//! | 2        | `$2`        | `TEXT[]` | frontier (or seed) ids     |
//! | 3        | `$3`        | `TEXT[]` | blocklisted ids            |
//! | 4        | `$4`        | `INT8`   | per-subject degree cap     |
//!
//! Binding the blocklist after the threshold hands a scalar to an array
//! placeholder, so the order is checked by [`PredicationQuery::check_binding_order`]
//! before any query leaves the builder.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::{ConceptId, MAX_CITATIONS};
use crate::error::{Error, Result};

/// Number of bound parameters in every predication query
pub const PARAM_COUNT: usize = 4;

/// Shape of the subject filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    /// Hop 1: rows whose subject or object is a seed
    Seed,
    /// Hop 2+: rows whose subject is in the frontier
    Frontier,
}

impl QueryScope {
    /// Scope used for a given hop number (1-based)
    pub fn for_hop(hop: u32) -> Self {
        if hop <= 1 { Self::Seed } else { Self::Frontier }
    }
}

/// A single bound parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryParam {
    TextArray(Vec<String>),
    BigInt(i64),
}

impl QueryParam {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TextArray(_) => "TEXT[]",
            Self::BigInt(_) => "INT8",
        }
    }

    pub fn as_text_array(&self) -> Option<&[String]> {
        match self {
            Self::TextArray(values) => Some(values),
            Self::BigInt(_) => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(value) => Some(*value),
            Self::TextArray(_) => None,
        }
    }
}

/// A ready-to-execute predication query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredicationQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub scope: QueryScope,
}

/// Result of building a query
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltQuery {
    /// Nothing to ask for; the caller skips execution
    Noop,
    Query(PredicationQuery),
}

impl BuiltQuery {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }

    pub fn into_query(self) -> Option<PredicationQuery> {
        match self {
            Self::Noop => None,
            Self::Query(query) => Some(query),
        }
    }
}

impl PredicationQuery {
    /// Verify the positional types: three arrays, then one scalar
    pub fn check_binding_order(&self) -> Result<()> {
        if self.params.len() != PARAM_COUNT {
            return Err(Error::InvariantViolation(format!(
                "predication query binds {} parameters, expected {}",
                self.params.len(),
                PARAM_COUNT
            )));
        }
        let expected = ["TEXT[]", "TEXT[]", "TEXT[]", "INT8"];
        for (position, (param, want)) in self.params.iter().zip(expected).enumerate() {
            if param.type_name() != want {
                return Err(Error::InvariantViolation(format!(
                    "parameter ${} bound as {} but the placeholder expects {}",
                    position + 1,
                    param.type_name(),
                    want
                )));
            }
        }
        Ok(())
    }

    pub fn predicates(&self) -> &[String] {
        self.params.first().and_then(QueryParam::as_text_array).unwrap_or_default()
    }

    pub fn frontier(&self) -> &[String] {
        self.params.get(1).and_then(QueryParam::as_text_array).unwrap_or_default()
    }

    pub fn blocklist(&self) -> &[String] {
        self.params.get(2).and_then(QueryParam::as_text_array).unwrap_or_default()
    }

    pub fn degree_threshold(&self) -> i64 {
        self.params.get(3).and_then(QueryParam::as_bigint).unwrap_or_default()
    }
}

/// Builds predication queries against one table
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    predicates: Vec<String>,
}

impl QueryBuilder {
    /// Create a builder for `schema.table`
    ///
    /// Both names must already be validated as plain identifiers.
    pub fn new(schema: &str, table: &str, predicates: Vec<String>) -> Self {
        Self {
            table: format!("{}.{}", schema, table),
            predicates,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Build the query for one hop
    ///
    /// Identifiers are validated again here; a malformed one is rejected
    /// before any SQL is produced.
    pub fn build<S: AsRef<str>>(
        &self,
        scope: QueryScope,
        frontier: &[S],
        blocklist: &BTreeSet<ConceptId>,
        degree_threshold: u32,
    ) -> Result<BuiltQuery> {
        let frontier: Vec<String> = frontier
            .iter()
            .map(|raw| ConceptId::parse(raw.as_ref()).map(String::from))
            .collect::<Result<_>>()?;

        if frontier.is_empty() {
            return Ok(BuiltQuery::Noop);
        }
        if degree_threshold == 0 {
            return Err(Error::invalid_config(
                "graph.degree_threshold",
                "must be a positive integer",
            ));
        }

        let params = vec![
            QueryParam::TextArray(self.predicates.clone()),
            QueryParam::TextArray(frontier),
            QueryParam::TextArray(blocklist.iter().map(|id| id.to_string()).collect()),
            QueryParam::BigInt(i64::from(degree_threshold)),
        ];

        let query = PredicationQuery {
            sql: self.render_sql(scope),
            params,
            scope,
        };
        query.check_binding_order()?;
        Ok(BuiltQuery::Query(query))
    }

    fn render_sql(&self, scope: QueryScope) -> String {
        let subject_filter = match scope {
            QueryScope::Seed => "(p.subject_cui = ANY($2) OR p.object_cui = ANY($2))",
            QueryScope::Frontier => "p.subject_cui = ANY($2)",
        };

        format!(
            r#"WITH candidate AS (
    SELECT p.subject_cui,
           MAX(p.subject_name) AS subject_name,
           MIN(p.predicate) AS predicate,
           p.object_cui,
           MAX(p.object_name) AS object_name,
           COUNT(DISTINCT p.pmid) AS evidence_count,
           (ARRAY_AGG(DISTINCT p.pmid::text ORDER BY p.pmid::text))[1:{max_citations}] AS citations
    FROM {table} p
    WHERE p.predicate = ANY($1)
      AND {subject_filter}
      AND NOT (p.subject_cui = ANY($3))
      AND NOT (p.object_cui = ANY($3))
    GROUP BY p.subject_cui, p.object_cui
), ranked AS (
    SELECT c.*,
           ROW_NUMBER() OVER (
               PARTITION BY c.subject_cui
               ORDER BY c.evidence_count DESC, c.object_cui ASC
           ) AS subject_rank
    FROM candidate c
)
SELECT subject_cui, subject_name, predicate, object_cui, object_name, evidence_count, citations
FROM ranked
WHERE subject_rank <= $4
ORDER BY subject_cui, subject_rank"#,
            max_citations = MAX_CITATIONS,
            table = self.table,
            subject_filter = subject_filter,
        )
    }
}
