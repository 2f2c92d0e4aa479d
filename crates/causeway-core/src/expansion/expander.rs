//! Hop expander
//!
//! Hops run strictly in sequence. Within a hop the frontier is split into
//! batches that are queried concurrently, never with more workers than the
//! store has connections. Every worker turns its rows into a private
//! [`HopDelta`]; the deltas are unioned in batch order and handed to the
//! assembler in one merge.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExpansionState, TerminationReason};
use crate::config::GraphSettings;
use crate::domain::{Assertion, CausalGraph, ConceptId};
use crate::error::{Error, Result};
use crate::graph::{GraphAssembler, HopDelta};
use crate::metrics::{DegradedScope, DegradedStage, HopMetrics};
use crate::query::{PredicationQuery, PredicationRow, PredicationStore, QueryBuilder, QueryScope};
use crate::retry::RetryPolicy;

/// Result of a completed expansion
#[derive(Debug, Clone)]
pub struct ExpansionReport {
    pub graph: CausalGraph,
    pub hops: Vec<HopMetrics>,
    pub degraded: Vec<DegradedScope>,
    pub termination: TerminationReason,
}

impl ExpansionReport {
    pub fn rows(&self) -> u64 {
        self.hops.iter().map(|h| h.rows).sum()
    }
}

/// Rows and delta produced by one frontier batch
struct BatchOutcome {
    rows: u64,
    delta: HopDelta,
}

/// Drives expansion from the seeds outward
pub struct HopExpander {
    store: Arc<dyn PredicationStore>,
    builder: QueryBuilder,
    settings: GraphSettings,
    retry: RetryPolicy,
    state: ExpansionState,
}

impl HopExpander {
    pub fn new(store: Arc<dyn PredicationStore>, builder: QueryBuilder, settings: GraphSettings) -> Self {
        let retry = RetryPolicy::exponential().with_max_attempts(settings.query_retries);
        Self {
            store,
            builder,
            settings,
            retry,
            state: ExpansionState::Seeding,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> ExpansionState {
        self.state
    }

    /// Number of concurrent queries issued within a hop
    pub fn workers(&self) -> usize {
        self.settings
            .max_parallel_queries
            .min(self.store.max_connections())
            .max(1)
    }

    /// Run every hop until a termination condition is met
    ///
    /// Fails only on configuration problems, invariant violations, or a
    /// store that stays unavailable after retries. A sub-batch whose query
    /// keeps failing is reported in [`ExpansionReport::degraded`].
    pub async fn run(&mut self) -> Result<ExpansionReport> {
        let started = Instant::now();
        self.state = ExpansionState::Seeding;

        let mut assembler = GraphAssembler::new(self.settings.blocklist.clone());
        let mut frontier = assembler.seed(&self.settings.exposures, &self.settings.outcomes)?;
        info!(
            seeds = frontier.len(),
            max_hops = self.settings.max_hops.get(),
            degree_threshold = self.settings.degree_threshold.get(),
            store = self.store.name(),
            "Starting expansion"
        );

        let mut hops = Vec::new();
        let mut degraded = Vec::new();
        let mut rows_total = 0u64;

        let termination = if frontier.is_empty() {
            TerminationReason::EmptyFrontier
        } else {
            let mut hop = 1u32;
            loop {
                self.state = ExpansionState::Expanding { hop };
                let hop_started = Instant::now();

                let (delta, mut metrics, mut hop_degraded) = self.expand_hop(hop, &frontier).await?;
                let outcome = assembler.merge(&delta)?;

                metrics.new_concepts = outcome.new_concepts.len();
                metrics.new_edges = outcome.new_edges;
                metrics.updated_edges = outcome.updated_edges;
                metrics.elapsed_ms = hop_started.elapsed().as_millis() as u64;
                rows_total += metrics.rows;

                info!(
                    hop,
                    scope = ?metrics.scope,
                    frontier = metrics.frontier_size,
                    batches = metrics.batches,
                    rows = metrics.rows,
                    new_concepts = metrics.new_concepts,
                    new_edges = metrics.new_edges,
                    degraded_batches = metrics.degraded_batches,
                    elapsed_ms = metrics.elapsed_ms,
                    "Hop complete"
                );

                hops.push(metrics);
                degraded.append(&mut hop_degraded);
                frontier = outcome.new_concepts;

                if frontier.is_empty() {
                    break TerminationReason::EmptyFrontier;
                }
                if hop >= self.settings.max_hops.get() {
                    break TerminationReason::MaxHops;
                }
                if self.settings.max_rows.is_some_and(|limit| rows_total >= limit) {
                    break TerminationReason::RowBudget;
                }
                if self
                    .settings
                    .max_duration
                    .is_some_and(|limit| started.elapsed() >= limit)
                {
                    break TerminationReason::TimeBudget;
                }
                hop += 1;
            }
        };

        self.state = ExpansionState::Terminated(termination);
        let graph = assembler.into_graph();
        info!(
            reason = %termination,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            rows = rows_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Expansion terminated"
        );

        Ok(ExpansionReport {
            graph,
            hops,
            degraded,
            termination,
        })
    }

    async fn expand_hop(
        &self,
        hop: u32,
        frontier: &[ConceptId],
    ) -> Result<(HopDelta, HopMetrics, Vec<DegradedScope>)> {
        let scope = QueryScope::for_hop(hop);
        let batches: Vec<Vec<ConceptId>> = frontier
            .chunks(self.settings.frontier_batch_size.max(1))
            .map(<[ConceptId]>::to_vec)
            .collect();

        let mut metrics = HopMetrics {
            hop,
            scope: Some(scope),
            frontier_size: frontier.len(),
            batches: batches.len(),
            ..Default::default()
        };

        let this = self;
        let mut results: Vec<(usize, Vec<ConceptId>, Result<BatchOutcome>)> =
            stream::iter(batches.into_iter().enumerate())
                .map(move |(index, batch)| async move {
                    let result = this.run_batch(hop, scope, index, &batch).await;
                    (index, batch, result)
                })
                .buffer_unordered(self.workers())
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut delta = HopDelta::new(hop);
        let mut degraded = Vec::new();
        for (index, batch, result) in results {
            match result {
                Ok(outcome) => {
                    metrics.rows += outcome.rows;
                    delta.union(outcome.delta);
                }
                Err(Error::QueryFailed(reason)) => {
                    warn!(hop, batch = index, concepts = batch.len(), %reason, "Skipping frontier batch");
                    metrics.degraded_batches += 1;
                    degraded.push(DegradedScope {
                        stage: DegradedStage::Expansion,
                        hop: Some(hop),
                        batch: index,
                        concepts: batch,
                        reason,
                    });
                }
                Err(fatal) => return Err(fatal),
            }
        }

        // Each batch honours the cap on its own; a subject reached from
        // several batches must still stay within it for the hop.
        delta.cap_per_subject(self.settings.degree_threshold.get());

        Ok((delta, metrics, degraded))
    }

    async fn run_batch(
        &self,
        hop: u32,
        scope: QueryScope,
        index: usize,
        batch: &[ConceptId],
    ) -> Result<BatchOutcome> {
        let built = self.builder.build(
            scope,
            batch,
            &self.settings.blocklist,
            self.settings.degree_threshold.get(),
        )?;
        let Some(query) = built.into_query() else {
            return Ok(BatchOutcome {
                rows: 0,
                delta: HopDelta::new(hop),
            });
        };

        let rows = self.fetch_with_retry(hop, index, &query).await?;
        debug!(hop, batch = index, rows = rows.len(), "Batch fetched");
        let count = rows.len() as u64;
        let delta = self.rows_to_delta(hop, scope, batch, rows)?;
        Ok(BatchOutcome { rows: count, delta })
    }

    async fn fetch_with_retry(
        &self,
        hop: u32,
        index: usize,
        query: &PredicationQuery,
    ) -> Result<Vec<PredicationRow>> {
        let mut attempt = 0u32;
        loop {
            match self.store.fetch(query).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(hop, batch = index, attempts = attempt, error = %err, "Predication query retries exhausted");
                        return Err(err.into());
                    }
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        hop,
                        batch = index,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Predication query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Check every row against the query contract and fold it into a delta
    fn rows_to_delta(
        &self,
        hop: u32,
        scope: QueryScope,
        batch: &[ConceptId],
        rows: Vec<PredicationRow>,
    ) -> Result<HopDelta> {
        let in_batch: HashSet<&ConceptId> = batch.iter().collect();
        let threshold = self.settings.degree_threshold.get();
        let mut per_subject: BTreeMap<ConceptId, u32> = BTreeMap::new();
        let mut delta = HopDelta::new(hop);

        for row in rows {
            let subject = parse_row_id(&row.subject_cui, "subject")?;
            let object = parse_row_id(&row.object_cui, "object")?;

            for id in [&subject, &object] {
                if self.settings.blocklist.contains(id) {
                    return Err(Error::InvariantViolation(format!(
                        "store returned blocklisted concept {} at hop {}",
                        id, hop
                    )));
                }
            }
            if !self.settings.predicates.iter().any(|p| p == &row.predicate) {
                return Err(Error::InvariantViolation(format!(
                    "store returned predicate {} which was not requested",
                    row.predicate
                )));
            }
            let in_scope = match scope {
                QueryScope::Seed => in_batch.contains(&subject) || in_batch.contains(&object),
                QueryScope::Frontier => in_batch.contains(&subject),
            };
            if !in_scope {
                return Err(Error::InvariantViolation(format!(
                    "row {} -> {} is outside the queried frontier",
                    subject, object
                )));
            }

            let count = per_subject.entry(subject.clone()).or_default();
            *count += 1;
            if *count > threshold {
                return Err(Error::InvariantViolation(format!(
                    "subject {} returned more than {} rows at hop {}",
                    subject, threshold, hop
                )));
            }

            if subject == object {
                debug!(concept = %subject, "Ignoring self-referential assertion");
                continue;
            }

            let evidence = u32::try_from(row.evidence_count.max(0)).unwrap_or(u32::MAX);
            let assertion = Assertion::new(subject, object, row.predicate, evidence, hop)
                .with_citations(row.citations);
            delta.add_assertion(assertion, &row.subject_name, &row.object_name);
        }

        Ok(delta)
    }
}

fn parse_row_id(raw: &str, position: &str) -> Result<ConceptId> {
    ConceptId::parse(raw).map_err(|_| {
        Error::InvariantViolation(format!("store returned malformed {} id '{}'", position, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConceptRole;
    use crate::query::{InMemoryPredicationStore, StoreError};
    use std::collections::BTreeSet;
    use std::num::NonZeroU32;

    fn id(s: &str) -> ConceptId {
        ConceptId::parse(s).unwrap()
    }

    fn settings(max_hops: u32, threshold: u32) -> GraphSettings {
        GraphSettings {
            exposures: vec![id("C0020538")],
            outcomes: vec![id("C0002395")],
            blocklist: BTreeSet::new(),
            max_hops: NonZeroU32::new(max_hops).unwrap(),
            degree_threshold: NonZeroU32::new(threshold).unwrap(),
            predicates: vec!["CAUSES".to_string()],
            frontier_batch_size: 200,
            max_parallel_queries: 4,
            query_retries: 3,
            max_rows: None,
            max_duration: None,
        }
    }

    fn chain_store() -> InMemoryPredicationStore {
        let mut store = InMemoryPredicationStore::new(Vec::new());
        store
            .add_causes(("C0020538", "Hypertension"), ("C0021368", "Inflammation"), 4)
            .add_causes(("C0021368", "Inflammation"), ("C0002395", "Alzheimer's Disease"), 3)
            .add_causes(("C0021368", "Inflammation"), ("C0018802", "Heart Failure"), 2)
            .add_causes(("C0018802", "Heart Failure"), ("C0011570", "Depression"), 1);
        store
    }

    fn expander(store: InMemoryPredicationStore, settings: GraphSettings) -> HopExpander {
        let builder = QueryBuilder::new("public", "causalpredication", settings.predicates.clone());
        HopExpander::new(Arc::new(store), builder, settings).with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_hops_record_first_discovery_depth() {
        let mut expander = expander(chain_store(), settings(3, 50));
        let report = expander.run().await.unwrap();

        let graph = &report.graph;
        assert_eq!(graph.node(&id("C0020538")).unwrap().role, ConceptRole::Exposure);
        assert_eq!(graph.node(&id("C0021368")).unwrap().depth, 1);
        assert_eq!(graph.node(&id("C0018802")).unwrap().depth, 2);
        assert_eq!(graph.node(&id("C0011570")).unwrap().depth, 3);
        assert_eq!(report.hops.len(), 3);
        assert_eq!(expander.state(), ExpansionState::Terminated(report.termination));
    }

    #[tokio::test]
    async fn test_max_hops_terminates() {
        let mut expander = expander(chain_store(), settings(1, 50));
        let report = expander.run().await.unwrap();

        assert_eq!(report.termination, TerminationReason::MaxHops);
        assert!(!report.graph.contains(&id("C0018802")));
    }

    #[tokio::test]
    async fn test_empty_frontier_terminates() {
        let mut expander = expander(chain_store(), settings(10, 50));
        let report = expander.run().await.unwrap();

        assert_eq!(report.termination, TerminationReason::EmptyFrontier);
        assert_eq!(report.hops.len(), 4);
        assert_eq!(report.hops.last().unwrap().new_concepts, 0);
    }

    #[tokio::test]
    async fn test_row_budget_terminates() {
        let mut settings = settings(10, 50);
        settings.max_rows = Some(1);
        let report = expander(chain_store(), settings).run().await.unwrap();

        assert_eq!(report.termination, TerminationReason::RowBudget);
        assert_eq!(report.hops.len(), 1);
    }

    /// Store that takes `delay` to answer every query
    struct SlowStore {
        inner: InMemoryPredicationStore,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl PredicationStore for SlowStore {
        async fn fetch(&self, query: &PredicationQuery) -> std::result::Result<Vec<PredicationRow>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.fetch(query).await
        }

        fn max_connections(&self) -> usize {
            self.inner.max_connections()
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_terminates() {
        let mut settings = settings(10, 50);
        settings.max_duration = Some(std::time::Duration::from_secs(5));
        let store = SlowStore {
            inner: chain_store(),
            delay: std::time::Duration::from_secs(3),
        };
        let builder = QueryBuilder::new("public", "causalpredication", settings.predicates.clone());
        let mut expander = HopExpander::new(Arc::new(store), builder, settings)
            .with_retry_policy(RetryPolicy::immediate(3));

        let report = expander.run().await.unwrap();

        assert_eq!(report.termination, TerminationReason::TimeBudget);
        assert_eq!(report.hops.len(), 2);
        assert!(report.graph.contains(&id("C0018802")));
        assert!(!report.graph.contains(&id("C0011570")));
    }

    #[tokio::test]
    async fn test_degree_threshold_holds_across_batches() {
        let mut store = InMemoryPredicationStore::new(Vec::new());
        store
            .add_causes(("C0000009", "Hub"), ("C0000001", "Seed A"), 1)
            .add_causes(("C0000009", "Hub"), ("C0000002", "Seed B"), 3);
        let mut settings = settings(1, 1);
        settings.exposures = vec![id("C0000001")];
        settings.outcomes = vec![id("C0000002")];
        settings.frontier_batch_size = 1;

        let report = expander(store, settings).run().await.unwrap();

        assert_eq!(report.hops[0].batches, 2);
        let from_hub: Vec<_> = report
            .graph
            .edges()
            .filter(|e| e.subject == id("C0000009"))
            .collect();
        assert_eq!(from_hub.len(), 1);
        assert_eq!(from_hub[0].object, id("C0000002"));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = chain_store();
        store
            .inject_failures([StoreError::Query("deadlock".into())])
            .await;
        let report = expander(store, settings(1, 50)).run().await.unwrap();

        assert!(report.degraded.is_empty());
        assert!(report.graph.contains(&id("C0021368")));
    }

    #[tokio::test]
    async fn test_query_failure_degrades_batch() {
        let store = chain_store();
        store
            .inject_failures(vec![StoreError::Query("statement timeout".into()); 3])
            .await;
        let report = expander(store, settings(1, 50)).run().await.unwrap();

        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].hop, Some(1));
        assert_eq!(report.hops[0].degraded_batches, 1);
        assert_eq!(report.graph.node_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal() {
        let store = chain_store();
        store
            .inject_failures(vec![StoreError::Unavailable("connection refused".into()); 3])
            .await;
        let err = expander(store, settings(2, 50)).run().await.unwrap_err();

        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_workers_bounded_by_pool() {
        let store = chain_store().with_max_connections(2);
        let mut settings = settings(1, 50);
        settings.max_parallel_queries = 16;
        assert_eq!(expander(store, settings).workers(), 2);
    }

    #[tokio::test]
    async fn test_batches_merge_in_order() {
        let mut settings = settings(2, 50);
        settings.frontier_batch_size = 1;
        let report = expander(chain_store(), settings.clone()).run().await.unwrap();

        settings.frontier_batch_size = 200;
        let single = expander(chain_store(), settings).run().await.unwrap();

        assert_eq!(report.graph, single.graph);
        assert_eq!(report.hops[0].batches, 2);
    }
}
