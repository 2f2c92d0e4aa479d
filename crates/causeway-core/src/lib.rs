//! Causeway Core Library
//!
//! Builds causal knowledge graphs from literature-derived predications:
//! - Domain model (concepts, causal assertions, the graph)
//! - Predication queries and stores (Postgres, in-memory)
//! - Multi-hop frontier expansion with bounded parallelism
//! - Single-writer graph assembly
//! - LLM-judged consolidation of duplicate concepts
//! - Artifacts (DAG text, JSON, binary) and a content-addressed cache
//! - Run metrics

pub mod config;
pub mod consolidation;
pub mod domain;
pub mod error;
pub mod expansion;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod retry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, GraphSettings};
    pub use crate::consolidation::{ConsolidationEngine, FixedJudge, LlmSimilarityJudge, SimilarityJudge};
    pub use crate::domain::{Assertion, CausalGraph, Concept, ConceptId, ConceptRole};
    pub use crate::error::{Error, Result};
    pub use crate::expansion::{HopExpander, TerminationReason};
    pub use crate::graph::GraphAssembler;
    pub use crate::metrics::{CacheOutcome, RunMetrics};
    pub use crate::persistence::{GraphCache, load_graph, write_artifacts};
    pub use crate::pipeline::{Pipeline, RunOutput};
    pub use crate::query::{InMemoryPredicationStore, PgPredicationStore, PredicationStore, QueryBuilder};
}
