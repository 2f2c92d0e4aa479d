//! Run metrics
//!
//! Advisory only: nothing in the engine reads these back. They are logged as
//! they are produced and written next to the artifacts as
//! `<stem>.metrics.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConceptId, GraphStats};
use crate::expansion::TerminationReason;
use crate::query::QueryScope;

/// Timing and volume of one expansion hop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HopMetrics {
    pub hop: u32,
    pub scope: Option<QueryScope>,
    pub frontier_size: usize,
    pub batches: usize,
    pub rows: u64,
    pub new_concepts: usize,
    pub new_edges: usize,
    pub updated_edges: usize,
    pub degraded_batches: usize,
    pub elapsed_ms: u64,
}

/// Whether the graph came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Lookup skipped on request
    Bypassed,
}

/// Stage in which a degradation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedStage {
    Expansion,
    Consolidation,
}

/// Work that was skipped after retries were exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedScope {
    pub stage: DegradedStage,
    /// Hop number for expansion sub-batches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop: Option<u32>,
    pub batch: usize,
    /// Concepts whose results are missing or left unconsolidated
    pub concepts: Vec<ConceptId>,
    pub reason: String,
}

/// Outcome of the consolidation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationMetrics {
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub batches_skipped: usize,
    pub clusters_merged: usize,
    pub concepts_removed: usize,
    pub edges_rewritten: usize,
    pub self_loops_dropped: usize,
    pub elapsed_ms: u64,
}

/// Everything recorded about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub cache_key: String,
    pub cache: CacheOutcome,
    #[serde(default)]
    pub hops: Vec<HopMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationMetrics>,
    #[serde(default)]
    pub degraded: Vec<DegradedScope>,
    #[serde(default)]
    pub graph: GraphStats,
    pub total_ms: u64,
}

impl RunMetrics {
    pub fn new(cache_key: impl Into<String>, cache: CacheOutcome) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            cache_key: cache_key.into(),
            cache,
            hops: Vec::new(),
            termination: None,
            consolidation: None,
            degraded: Vec::new(),
            graph: GraphStats::default(),
            total_ms: 0,
        }
    }

    /// Whether any part of the run was skipped
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.hops.iter().map(|h| h.rows).sum()
    }

    /// Stamp the end of the run
    pub fn finish(&mut self, stats: GraphStats) {
        let now = Utc::now();
        self.total_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self.graph = stats;
    }
}
