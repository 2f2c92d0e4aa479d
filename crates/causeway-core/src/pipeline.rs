//! End-to-end graph build
//!
//! validate → cache lookup → expand → consolidate → verify → cache store →
//! artifacts. A cache hit skips straight to the artifacts.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, GraphSettings};
use crate::consolidation::{ConsolidationCluster, ConsolidationEngine, SimilarityJudge};
use crate::domain::CausalGraph;
use crate::error::{Error, Result};
use crate::expansion::{HopExpander, TerminationReason};
use crate::metrics::{CacheOutcome, RunMetrics};
use crate::persistence::{ArtifactPaths, GraphCache, cache_key, source_id, write_artifacts};
use crate::query::{PredicationStore, QueryBuilder};
use crate::retry::RetryPolicy;

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub graph: CausalGraph,
    pub clusters: Vec<ConsolidationCluster>,
    pub metrics: RunMetrics,
    pub artifacts: ArtifactPaths,
}

/// One configured graph build
pub struct Pipeline {
    config: Config,
    settings: GraphSettings,
    store: Arc<dyn PredicationStore>,
    judge: Option<Arc<dyn SimilarityJudge>>,
    cache: Option<GraphCache>,
    retry: Option<RetryPolicy>,
}

impl Pipeline {
    /// Validate `config` and prepare a run against `store`
    ///
    /// The cache lives in the configured cache directory; use
    /// [`without_cache`](Self::without_cache) to bypass it.
    pub fn new(config: Config, store: Arc<dyn PredicationStore>) -> Result<Self> {
        let settings = config.validate()?;
        let cache = GraphCache::new(config.output.resolved_cache_dir());
        Ok(Self {
            config,
            settings,
            store,
            judge: None,
            cache: Some(cache),
            retry: None,
        })
    }

    pub fn with_judge(mut self, judge: Arc<dyn SimilarityJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_cache(mut self, cache: GraphCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Override the backoff used for store queries and judge calls
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn consolidation_enabled(&self) -> bool {
        self.config.consolidation.enabled
    }

    pub fn cache_key(&self) -> String {
        let source = source_id(&self.store.source(), &self.config.database);
        cache_key(&self.settings, self.consolidation_enabled(), &source)
    }

    pub async fn run(&self) -> Result<RunOutput> {
        let judge = self.active_judge()?;
        let key = self.cache_key();
        info!(
            key = %key,
            exposures = self.settings.exposures.len(),
            outcomes = self.settings.outcomes.len(),
            blocklist = self.settings.blocklist.len(),
            max_hops = self.settings.max_hops.get(),
            degree_threshold = self.settings.degree_threshold.get(),
            consolidation = judge.is_some(),
            "Starting graph build"
        );

        if let Some(cache) = &self.cache {
            if let Some(graph) = cache.load(&key).await? {
                graph.verify(&self.settings.blocklist)?;
                let metrics = RunMetrics::new(key, CacheOutcome::Hit);
                return self.finish(graph, Vec::new(), metrics);
            }
        }

        let outcome = if self.cache.is_some() {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Bypassed
        };
        let mut metrics = RunMetrics::new(key.clone(), outcome);

        let builder = QueryBuilder::new(
            &self.config.database.schema,
            &self.config.database.table,
            self.settings.predicates.clone(),
        );
        let mut expander = HopExpander::new(Arc::clone(&self.store), builder, self.settings.clone());
        if let Some(retry) = &self.retry {
            expander = expander.with_retry_policy(retry.clone());
        }
        let expansion = expander.run().await?;
        metrics.hops = expansion.hops;
        metrics.termination = Some(expansion.termination);
        metrics.degraded.extend(expansion.degraded);
        let mut graph = expansion.graph;

        let mut clusters = Vec::new();
        if let Some(judge) = judge {
            let mut engine = ConsolidationEngine::new(judge, &self.config.consolidation);
            if let Some(retry) = &self.retry {
                engine = engine.with_retry_policy(retry.clone());
            }
            let report = engine.consolidate(graph).await?;
            graph = report.graph;
            clusters = report.clusters;
            metrics.consolidation = Some(report.metrics);
            metrics.degraded.extend(report.degraded);
        }

        graph.verify(&self.settings.blocklist)?;

        if let Some(cache) = &self.cache {
            if is_cacheable(&metrics) {
                if let Err(e) = cache.store(&key, &graph).await {
                    warn!(key = %key, error = %e, "Failed to store cache entry");
                }
            } else {
                warn!(
                    key = %key,
                    degraded = metrics.degraded.len(),
                    termination = ?metrics.termination,
                    "Run is incomplete, not caching"
                );
            }
        }

        self.finish(graph, clusters, metrics)
    }

    fn active_judge(&self) -> Result<Option<Arc<dyn SimilarityJudge>>> {
        if !self.consolidation_enabled() {
            return Ok(None);
        }
        self.judge.clone().map(Some).ok_or_else(|| {
            Error::invalid_config(
                "consolidation.enabled",
                "consolidation is enabled but no similarity judge is configured",
            )
        })
    }

    fn finish(
        &self,
        graph: CausalGraph,
        clusters: Vec<ConsolidationCluster>,
        mut metrics: RunMetrics,
    ) -> Result<RunOutput> {
        metrics.finish(graph.stats());
        let artifacts = write_artifacts(
            &graph,
            &metrics,
            &self.config.output.directory,
            &self.config.output.stem,
        )?;

        info!(
            nodes = metrics.graph.nodes,
            edges = metrics.graph.edges,
            cache = ?metrics.cache,
            degraded = metrics.degraded.len(),
            total_ms = metrics.total_ms,
            "Graph build complete"
        );
        if metrics.is_degraded() {
            warn!(
                scopes = metrics.degraded.len(),
                "Graph is incomplete; see the metrics artifact for the skipped scopes"
            );
        }

        Ok(RunOutput {
            graph,
            clusters,
            metrics,
            artifacts,
        })
    }
}

/// Only complete runs are cached; budgets are not part of the key
fn is_cacheable(metrics: &RunMetrics) -> bool {
    !metrics.is_degraded()
        && matches!(
            metrics.termination,
            Some(TerminationReason::MaxHops | TerminationReason::EmptyFrontier)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{DegradedScope, DegradedStage};

    #[test]
    fn test_only_complete_runs_are_cacheable() {
        let mut metrics = RunMetrics::new("k", CacheOutcome::Miss);
        metrics.termination = Some(TerminationReason::MaxHops);
        assert!(is_cacheable(&metrics));

        metrics.termination = Some(TerminationReason::RowBudget);
        assert!(!is_cacheable(&metrics));

        metrics.termination = Some(TerminationReason::EmptyFrontier);
        metrics.degraded.push(DegradedScope {
            stage: DegradedStage::Expansion,
            hop: Some(1),
            batch: 0,
            concepts: Vec::new(),
            reason: "query failed".to_string(),
        });
        assert!(!is_cacheable(&metrics));
    }

    #[test]
    fn test_enabled_consolidation_requires_a_judge() {
        let mut config = Config::default();
        config.graph.exposures = vec!["C0020538".to_string()];
        let store = Arc::new(crate::query::InMemoryPredicationStore::default());
        let pipeline = Pipeline::new(config, store).unwrap();
        assert!(pipeline.active_judge().is_err());
    }
}
