//! Graph assembly
//!
//! Expansion workers never touch the shared graph. Each one builds a
//! [`HopDelta`] from its own rows; deltas are unioned in batch order and the
//! result is applied by the single writer, [`GraphAssembler::merge`]. Readers
//! hold an `Arc` snapshot that later merges never mutate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::domain::{Assertion, CausalGraph, Concept, ConceptId, ConceptRole, EdgeKey};
use crate::error::{Error, Result};

/// Nodes and edges observed by one worker (or one hop, once unioned)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HopDelta {
    hop: u32,
    concepts: BTreeMap<ConceptId, String>,
    assertions: BTreeMap<EdgeKey, Assertion>,
}

impl HopDelta {
    pub fn new(hop: u32) -> Self {
        Self {
            hop,
            ..Default::default()
        }
    }

    pub fn hop(&self) -> u32 {
        self.hop
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty() && self.assertions.is_empty()
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    pub fn assertion_count(&self) -> usize {
        self.assertions.len()
    }

    pub fn concepts(&self) -> impl Iterator<Item = (&ConceptId, &str)> {
        self.concepts.iter().map(|(id, name)| (id, name.as_str()))
    }

    pub fn assertions(&self) -> impl Iterator<Item = &Assertion> {
        self.assertions.values()
    }

    /// Record a concept mention; the first non-empty name wins
    pub fn add_concept(&mut self, id: ConceptId, name: &str) {
        let entry = self.concepts.entry(id).or_default();
        if entry.is_empty() {
            *entry = name.trim().to_string();
        }
    }

    /// Record an assertion along with both endpoints
    pub fn add_assertion(&mut self, assertion: Assertion, subject_name: &str, object_name: &str) {
        self.add_concept(assertion.subject.clone(), subject_name);
        self.add_concept(assertion.object.clone(), object_name);
        match self.assertions.get_mut(&assertion.key()) {
            Some(existing) => existing.observe(&assertion),
            None => {
                self.assertions.insert(assertion.key(), assertion);
            }
        }
    }

    /// Fold another worker's delta into this one
    pub fn union(&mut self, other: HopDelta) {
        for (id, name) in other.concepts {
            self.add_concept(id, &name);
        }
        for (key, assertion) in other.assertions {
            match self.assertions.get_mut(&key) {
                Some(existing) => existing.observe(&assertion),
                None => {
                    self.assertions.insert(key, assertion);
                }
            }
        }
    }

    /// Keep at most `limit` assertions per subject; returns how many were dropped
    ///
    /// Ranking matches the store: evidence descending, then object id.
    /// Concepts that only appeared in dropped assertions are removed too.
    pub fn cap_per_subject(&mut self, limit: u32) -> usize {
        let limit = limit as usize;
        let mut ranked: BTreeMap<&ConceptId, Vec<&Assertion>> = BTreeMap::new();
        for assertion in self.assertions.values() {
            ranked.entry(&assertion.subject).or_default().push(assertion);
        }

        let mut dropped: Vec<EdgeKey> = Vec::new();
        for (_, mut edges) in ranked {
            if edges.len() <= limit {
                continue;
            }
            edges.sort_by(|a, b| {
                b.provenance
                    .evidence_count
                    .cmp(&a.provenance.evidence_count)
                    .then_with(|| a.object.cmp(&b.object))
            });
            dropped.extend(edges[limit..].iter().map(|a| a.key()));
        }
        if dropped.is_empty() {
            return 0;
        }

        for key in &dropped {
            self.assertions.remove(key);
        }
        let referenced: BTreeSet<&ConceptId> = self
            .assertions
            .values()
            .flat_map(|a| [&a.subject, &a.object])
            .collect();
        let orphaned: Vec<ConceptId> = self
            .concepts
            .keys()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect();
        for id in orphaned {
            self.concepts.remove(&id);
        }

        debug!(hop = self.hop, dropped = dropped.len(), limit, "Capped subject degree across batches");
        dropped.len()
    }
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Concepts first discovered by this merge, in identifier order
    pub new_concepts: Vec<ConceptId>,
    pub new_edges: usize,
    /// Existing edges whose provenance changed
    pub updated_edges: usize,
}

/// Single writer for the working graph
#[derive(Debug, Clone)]
pub struct GraphAssembler {
    graph: Arc<CausalGraph>,
    blocklist: Arc<BTreeSet<ConceptId>>,
}

impl GraphAssembler {
    pub fn new(blocklist: BTreeSet<ConceptId>) -> Self {
        Self {
            graph: Arc::new(CausalGraph::new()),
            blocklist: Arc::new(blocklist),
        }
    }

    /// Continue assembling on top of an existing graph
    pub fn from_graph(graph: CausalGraph, blocklist: BTreeSet<ConceptId>) -> Result<Self> {
        graph.verify(&blocklist)?;
        Ok(Self {
            graph: Arc::new(graph),
            blocklist: Arc::new(blocklist),
        })
    }

    pub fn blocklist(&self) -> &BTreeSet<ConceptId> {
        &self.blocklist
    }

    /// Insert the seed concepts at depth 0 and return them as the first frontier
    ///
    /// A concept listed both as exposure and outcome keeps the exposure role.
    pub fn seed(&mut self, exposures: &[ConceptId], outcomes: &[ConceptId]) -> Result<Vec<ConceptId>> {
        let tagged = exposures
            .iter()
            .map(|id| (id, ConceptRole::Exposure))
            .chain(outcomes.iter().map(|id| (id, ConceptRole::Outcome)));

        let mut frontier = Vec::new();
        let graph = Arc::make_mut(&mut self.graph);
        for (id, role) in tagged {
            if self.blocklist.contains(id) {
                return Err(Error::InvariantViolation(format!(
                    "seed concept {} is blocklisted",
                    id
                )));
            }
            if graph.insert_node(Concept::seed(id.clone(), role)) {
                frontier.push(id.clone());
            }
        }
        debug!(seeds = frontier.len(), "Seeded graph");
        Ok(frontier)
    }

    /// Apply a hop delta
    ///
    /// The delta is checked in full before anything is written, so a
    /// rejected delta leaves the graph untouched. Re-applying a delta is a
    /// no-op apart from evidence saturation.
    pub fn merge(&mut self, delta: &HopDelta) -> Result<MergeOutcome> {
        for (id, _) in delta.concepts() {
            if self.blocklist.contains(id) {
                return Err(Error::InvariantViolation(format!(
                    "blocklisted concept {} reached the assembler at hop {}",
                    id,
                    delta.hop()
                )));
            }
        }
        for assertion in delta.assertions() {
            for endpoint in [&assertion.subject, &assertion.object] {
                if !self.graph.contains(endpoint) && !delta.concepts.contains_key(endpoint) {
                    return Err(Error::InvariantViolation(format!(
                        "assertion {} -> {} references unknown concept {}",
                        assertion.subject, assertion.object, endpoint
                    )));
                }
            }
        }

        let mut outcome = MergeOutcome::default();
        let graph = Arc::make_mut(&mut self.graph);

        for (id, name) in delta.concepts() {
            match graph.node_mut(id) {
                Some(existing) => {
                    if existing.name.is_empty() && !name.is_empty() {
                        existing.name = name.to_string();
                    }
                }
                None => {
                    graph.insert_node(Concept::discovered(id.clone(), name, delta.hop()));
                    outcome.new_concepts.push(id.clone());
                }
            }
        }

        for assertion in delta.assertions() {
            match graph.edge(&assertion.subject, &assertion.object) {
                Some(existing) => {
                    let mut folded = existing.clone();
                    folded.observe(assertion);
                    if &folded != existing {
                        graph.put_edge(folded)?;
                        outcome.updated_edges += 1;
                    }
                }
                None => {
                    graph.put_edge(assertion.clone())?;
                    outcome.new_edges += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Read-only view of the graph as of the last merge
    pub fn snapshot(&self) -> Arc<CausalGraph> {
        Arc::clone(&self.graph)
    }

    pub fn into_graph(self) -> CausalGraph {
        Arc::try_unwrap(self.graph).unwrap_or_else(|shared| (*shared).clone())
    }
}
