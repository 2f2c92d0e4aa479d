//! Consolidation engine
//!
//! Offers every node to the judge in bounded batches, joins the returned
//! clusters transitively and collapses each cluster onto one representative.
//! The representative has the highest total edge evidence; ties go to the
//! shortest identifier, then the lexicographically smallest.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::judge::{CandidateConcept, SimilarityJudge};
use super::union_find::UnionFind;
use crate::config::ConsolidationConfig;
use crate::domain::{CausalGraph, ConceptId};
use crate::error::{Error, Result};
use crate::metrics::{ConsolidationMetrics, DegradedScope, DegradedStage};
use crate::retry::RetryPolicy;

/// A set of equivalent concepts and the node they collapse to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationCluster {
    pub representative: ConceptId,
    /// Non-canonical members, sorted
    pub members: Vec<ConceptId>,
}

/// Output of one consolidation pass
#[derive(Debug, Clone)]
pub struct ConsolidationReport {
    pub graph: CausalGraph,
    pub clusters: Vec<ConsolidationCluster>,
    pub metrics: ConsolidationMetrics,
    pub degraded: Vec<DegradedScope>,
}

pub struct ConsolidationEngine {
    judge: Arc<dyn SimilarityJudge>,
    batch_size: usize,
    max_concurrency: usize,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl ConsolidationEngine {
    pub fn new(judge: Arc<dyn SimilarityJudge>, config: &ConsolidationConfig) -> Self {
        Self {
            judge,
            batch_size: config.batch_size.max(2),
            max_concurrency: config.max_concurrency.max(1),
            call_timeout: Duration::from_secs(config.call_timeout_secs.max(1)),
            retry: RetryPolicy::exponential().with_max_attempts(config.max_retries),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Candidate batches in canonical-name order
    pub fn batches(&self, graph: &CausalGraph) -> Vec<Vec<CandidateConcept>> {
        let mut candidates: Vec<CandidateConcept> = graph
            .nodes()
            .map(|node| CandidateConcept {
                id: node.id.clone(),
                name: node.display_name().to_string(),
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
            .chunks(self.batch_size)
            .map(<[CandidateConcept]>::to_vec)
            .collect()
    }

    /// Run one consolidation pass
    ///
    /// Never fails because of the judge: a batch that keeps failing is
    /// skipped and listed in [`ConsolidationReport::degraded`]. Running the
    /// pass again on its own output with the same judgments merges nothing.
    pub async fn consolidate(&self, graph: CausalGraph) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let batches = self.batches(&graph);
        let mut metrics = ConsolidationMetrics {
            batches_total: batches.len(),
            ..Default::default()
        };

        if graph.node_count() < 2 {
            metrics.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(ConsolidationReport {
                graph,
                clusters: Vec::new(),
                metrics,
                degraded: Vec::new(),
            });
        }

        let this = self;
        let mut results: Vec<(usize, Vec<CandidateConcept>, Result<Vec<Vec<ConceptId>>>)> =
            stream::iter(batches.into_iter().enumerate())
                .map(move |(index, batch)| async move {
                    let result = this.judge_with_retry(index, &batch).await;
                    (index, batch, result)
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut sets = UnionFind::new();
        let mut degraded = Vec::new();
        for (index, batch, result) in results {
            match result {
                Ok(clusters) => {
                    metrics.batches_succeeded += 1;
                    let offered: BTreeSet<&ConceptId> = batch.iter().map(|c| &c.id).collect();
                    for cluster in clusters {
                        let members: Vec<&ConceptId> =
                            cluster.iter().filter(|id| offered.contains(id)).collect();
                        for pair in members.windows(2) {
                            sets.union(pair[0], pair[1]);
                        }
                    }
                }
                Err(err) => {
                    warn!(batch = index, candidates = batch.len(), error = %err, "Skipping consolidation batch");
                    metrics.batches_skipped += 1;
                    degraded.push(DegradedScope {
                        stage: DegradedStage::Consolidation,
                        hop: None,
                        batch: index,
                        concepts: batch.into_iter().map(|c| c.id).collect(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let clusters = select_representatives(&graph, sets.groups());
        let graph = apply_clusters(graph, &clusters, &mut metrics)?;

        metrics.clusters_merged = clusters.len();
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            judge = self.judge.name(),
            batches = metrics.batches_total,
            skipped = metrics.batches_skipped,
            clusters = metrics.clusters_merged,
            removed = metrics.concepts_removed,
            edges_rewritten = metrics.edges_rewritten,
            elapsed_ms = metrics.elapsed_ms,
            "Consolidation complete"
        );

        Ok(ConsolidationReport {
            graph,
            clusters,
            metrics,
            degraded,
        })
    }

    async fn judge_with_retry(
        &self,
        index: usize,
        batch: &[CandidateConcept],
    ) -> Result<Vec<Vec<ConceptId>>> {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, self.judge.judge(batch)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.call_timeout.as_secs())),
            };

            match result {
                Ok(clusters) => return Ok(clusters),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        batch = index,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Similarity judgment failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Pick one representative per group
fn select_representatives(
    graph: &CausalGraph,
    groups: Vec<BTreeSet<ConceptId>>,
) -> Vec<ConsolidationCluster> {
    let mut evidence: HashMap<&ConceptId, u64> = HashMap::new();
    for edge in graph.edges() {
        let weight = u64::from(edge.provenance.evidence_count);
        *evidence.entry(&edge.subject).or_default() += weight;
        *evidence.entry(&edge.object).or_default() += weight;
    }

    let mut clusters: Vec<ConsolidationCluster> = groups
        .into_iter()
        .filter_map(|group| {
            let representative = group
                .iter()
                .min_by_key(|id| {
                    (
                        Reverse(evidence.get(id).copied().unwrap_or(0)),
                        id.as_str().len(),
                        (*id).clone(),
                    )
                })?
                .clone();
            let members = group.into_iter().filter(|id| id != &representative).collect();
            Some(ConsolidationCluster {
                representative,
                members,
            })
        })
        .collect();
    clusters.sort_by(|a, b| a.representative.cmp(&b.representative));
    clusters
}

/// Collapse every cluster onto its representative and rewrite edges
fn apply_clusters(
    graph: CausalGraph,
    clusters: &[ConsolidationCluster],
    metrics: &mut ConsolidationMetrics,
) -> Result<CausalGraph> {
    if clusters.is_empty() {
        return Ok(graph);
    }

    let mut canonical: BTreeMap<ConceptId, ConceptId> = BTreeMap::new();
    for cluster in clusters {
        for member in &cluster.members {
            canonical.insert(member.clone(), cluster.representative.clone());
        }
    }
    let resolve = |id: &ConceptId| canonical.get(id).cloned().unwrap_or_else(|| id.clone());

    let mut merged = CausalGraph::new();
    for node in graph.nodes() {
        if !canonical.contains_key(&node.id) {
            merged.insert_node(node.clone());
        }
    }

    for cluster in clusters {
        let mut absorbed: BTreeSet<ConceptId> = BTreeSet::new();
        let mut depth = None;
        for member in &cluster.members {
            if let Some(node) = graph.node(member) {
                absorbed.insert(member.clone());
                absorbed.extend(node.merged.iter().cloned());
                depth = Some(depth.map_or(node.depth, |d: u32| d.min(node.depth)));
            }
        }

        let node = merged.node_mut(&cluster.representative).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "representative {} is missing from the graph",
                cluster.representative
            ))
        })?;
        absorbed.extend(node.merged.iter().cloned());
        node.merged = absorbed.into_iter().collect();
        if let Some(depth) = depth {
            node.depth = node.depth.min(depth);
        }
        metrics.concepts_removed += cluster.members.len();
        debug!(
            representative = %cluster.representative,
            members = cluster.members.len(),
            "Collapsed cluster"
        );
    }

    for edge in graph.edges() {
        let subject = resolve(&edge.subject);
        let object = resolve(&edge.object);
        let rewritten = subject != edge.subject || object != edge.object;
        if !rewritten {
            match merged.edge(&subject, &object).cloned() {
                Some(mut existing) => {
                    existing.absorb(edge);
                    merged.put_edge(existing)?;
                }
                None => merged.put_edge(edge.clone())?,
            }
            continue;
        }

        if subject == object {
            metrics.self_loops_dropped += 1;
            continue;
        }
        metrics.edges_rewritten += 1;

        let mut moved = edge.clone();
        moved.subject = subject;
        moved.object = object;
        match merged.edge(&moved.subject, &moved.object).cloned() {
            Some(mut existing) => {
                existing.absorb(&moved);
                merged.put_edge(existing)?;
            }
            None => merged.put_edge(moved)?,
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::judge::FixedJudge;
    use crate::domain::{Assertion, CAUSES, Concept, ConceptRole};

    fn id(s: &str) -> ConceptId {
        ConceptId::parse(s).unwrap()
    }

    fn graph() -> CausalGraph {
        let mut graph = CausalGraph::new();
        graph.insert_node(Concept::seed(id("C0020538"), ConceptRole::Exposure));
        graph.node_mut(&id("C0020538")).unwrap().name = "Hypertension".into();
        graph.insert_node(Concept::discovered(id("C0027051"), "Myocardial Infarction", 1));
        graph.insert_node(Concept::discovered(id("C0018802"), "Heart Attack", 1));
        graph.insert_node(Concept::discovered(id("C0011570"), "Depression", 2));
        for (s, o, e) in [
            ("C0020538", "C0027051", 5),
            ("C0020538", "C0018802", 2),
            ("C0018802", "C0011570", 3),
            ("C0027051", "C0018802", 1),
        ] {
            graph
                .put_edge(Assertion::new(id(s), id(o), CAUSES, e, 1))
                .unwrap();
        }
        graph
    }

    fn engine(judge: FixedJudge) -> ConsolidationEngine {
        ConsolidationEngine::new(Arc::new(judge), &ConsolidationConfig::default())
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_merge_rewrites_edges_onto_representative() {
        let report = engine(FixedJudge::new([["Myocardial Infarction", "Heart Attack"]]))
            .consolidate(graph())
            .await
            .unwrap();

        let graph = &report.graph;
        assert_eq!(graph.node_count(), 3);
        assert_eq!(report.clusters.len(), 1);

        // MI: 5 + 1 = 6, Heart Attack: 2 + 3 + 1 = 6; tie on length, then lexicographic
        let rep = &report.clusters[0].representative;
        assert_eq!(rep, &id("C0018802"));
        assert_eq!(graph.node(rep).unwrap().merged, vec![id("C0027051")]);

        let folded = graph.edge(&id("C0020538"), &id("C0018802")).unwrap();
        assert_eq!(folded.provenance.evidence_count, 7);
        assert!(graph.edge(&id("C0018802"), &id("C0011570")).is_some());
        assert_eq!(report.metrics.self_loops_dropped, 1);
        assert!(graph.verify(&BTreeSet::new()).is_ok());
    }

    #[tokio::test]
    async fn test_consolidation_is_idempotent() {
        let engine = engine(FixedJudge::new([["Myocardial Infarction", "Heart Attack"]]));
        let once = engine.consolidate(graph()).await.unwrap();
        let twice = engine.consolidate(once.graph.clone()).await.unwrap();

        assert!(twice.clusters.is_empty());
        assert_eq!(once.graph, twice.graph);
    }

    #[tokio::test]
    async fn test_transitive_clusters() {
        let judge = FixedJudge::new(vec![
            vec!["C0027051", "C0018802"],
            vec!["C0018802", "C0011570"],
        ]);
        let report = engine(judge).consolidate(graph()).await.unwrap();

        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].members.len(), 2);
        assert_eq!(report.graph.node_count(), 2);
    }

    #[tokio::test]
    async fn test_representative_role_propagates() {
        let judge = FixedJudge::new([["Hypertension", "Depression"]]);
        let report = engine(judge).consolidate(graph()).await.unwrap();

        // Hypertension carries 7 evidence against 3
        let rep = &report.clusters[0].representative;
        assert_eq!(rep, &id("C0020538"));
        let node = report.graph.node(rep).unwrap();
        assert_eq!(node.role, ConceptRole::Exposure);
        assert_eq!(node.depth, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped_and_reported() {
        let judge = FixedJudge::new([["Myocardial Infarction", "Heart Attack"]]).failing(3);
        let report = engine(judge).consolidate(graph()).await.unwrap();

        assert_eq!(report.graph, graph());
        assert_eq!(report.metrics.batches_skipped, 1);
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].concepts.len(), 4);
    }

    #[tokio::test]
    async fn test_failure_then_success_is_retried() {
        let judge = FixedJudge::new([["Myocardial Infarction", "Heart Attack"]]).failing(2);
        let report = engine(judge).consolidate(graph()).await.unwrap();

        assert!(report.degraded.is_empty());
        assert_eq!(report.clusters.len(), 1);
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let config = ConsolidationConfig {
            batch_size: 3,
            ..Default::default()
        };
        let engine = ConsolidationEngine::new(Arc::new(FixedJudge::empty()), &config);
        let batches = engine.batches(&graph());
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() <= 3));
        assert_eq!(batches[0][0].name, "Depression");
    }

    struct SlowJudge;

    #[async_trait::async_trait]
    impl SimilarityJudge for SlowJudge {
        async fn judge(&self, _batch: &[CandidateConcept]) -> Result<Vec<Vec<ConceptId>>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_calls_are_cancelled() {
        let engine = ConsolidationEngine::new(Arc::new(SlowJudge), &ConsolidationConfig::default())
            .with_retry_policy(RetryPolicy::immediate(2))
            .with_call_timeout(Duration::from_secs(5));

        let report = engine.consolidate(graph()).await.unwrap();
        assert_eq!(report.metrics.batches_skipped, 1);
        assert!(report.degraded[0].reason.contains("timed out"));
    }
}
