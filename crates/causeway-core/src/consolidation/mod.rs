//! Consolidation of semantically duplicate concepts

pub mod engine;
pub mod judge;
pub mod union_find;

pub use engine::{ConsolidationCluster, ConsolidationEngine, ConsolidationReport};
pub use judge::{CandidateConcept, FixedJudge, LlmSimilarityJudge, SimilarityJudge, parse_cluster_response};
pub use union_find::UnionFind;
