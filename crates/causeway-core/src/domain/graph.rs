//! In-memory causal graph
//!
//! Nodes and edges live in ordered maps so that every encoder walks them in
//! the same order and artifacts are byte-stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::assertion::Assertion;
use super::concept::{Concept, ConceptId, ConceptRole};
use crate::error::{Error, Result};

/// Edge key: `(subject, object)`
pub type EdgeKey = (ConceptId, ConceptId);

/// Directed causal graph of concepts and assertions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CausalGraph {
    nodes: BTreeMap<ConceptId, Concept>,
    edges: BTreeMap<EdgeKey, Assertion>,
}

/// Summary counts of a graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub exposures: usize,
    pub outcomes: usize,
    pub mediators: usize,
    pub unclassified: usize,
    pub max_depth: u32,
}

/// Flat, serializable form of a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphArchive {
    pub nodes: Vec<Concept>,
    pub edges: Vec<Assertion>,
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &ConceptId) -> Option<&Concept> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &ConceptId) -> Option<&mut Concept> {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, subject: &ConceptId, object: &ConceptId) -> Option<&Assertion> {
        self.edges.get(&(subject.clone(), object.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Concept> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Assertion> {
        self.edges.values()
    }

    pub fn node_ids(&self) -> BTreeSet<ConceptId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn edge_keys(&self) -> BTreeSet<EdgeKey> {
        self.edges.keys().cloned().collect()
    }

    /// Insert a node; returns `false` if one with the same id already exists
    ///
    /// Existing nodes are never overwritten, which keeps the first recorded
    /// discovery depth and role.
    pub fn insert_node(&mut self, concept: Concept) -> bool {
        if self.nodes.contains_key(&concept.id) {
            return false;
        }
        self.nodes.insert(concept.id.clone(), concept);
        true
    }

    /// Insert or replace an edge without folding
    ///
    /// Both endpoints must already be present.
    pub fn put_edge(&mut self, assertion: Assertion) -> Result<()> {
        for endpoint in [&assertion.subject, &assertion.object] {
            if !self.nodes.contains_key(endpoint) {
                return Err(Error::InvariantViolation(format!(
                    "edge {} -> {} references missing node {}",
                    assertion.subject, assertion.object, endpoint
                )));
            }
        }
        self.edges.insert(assertion.key(), assertion);
        Ok(())
    }

    pub fn remove_edge(&mut self, key: &EdgeKey) -> Option<Assertion> {
        self.edges.remove(key)
    }

    pub fn remove_node(&mut self, id: &ConceptId) -> Option<Concept> {
        self.nodes.remove(id)
    }

    /// Sum of evidence over every edge touching `id`
    pub fn total_evidence(&self, id: &ConceptId) -> u64 {
        self.edges
            .values()
            .filter(|e| &e.subject == id || &e.object == id)
            .map(|e| u64::from(e.provenance.evidence_count))
            .sum()
    }

    /// Check referential integrity and the absence of blocklisted nodes
    pub fn verify(&self, blocklist: &BTreeSet<ConceptId>) -> Result<()> {
        if let Some(blocked) = self.nodes.keys().find(|id| blocklist.contains(*id)) {
            return Err(Error::InvariantViolation(format!(
                "blocklisted concept {} is present in the graph",
                blocked
            )));
        }

        for ((subject, object), edge) in &self.edges {
            if &edge.subject != subject || &edge.object != object {
                return Err(Error::InvariantViolation(format!(
                    "edge keyed {} -> {} stores {} -> {}",
                    subject, object, edge.subject, edge.object
                )));
            }
            if !self.nodes.contains_key(subject) || !self.nodes.contains_key(object) {
                return Err(Error::InvariantViolation(format!(
                    "edge {} -> {} has a dangling endpoint",
                    subject, object
                )));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            ..Default::default()
        };
        for node in self.nodes.values() {
            match node.role {
                ConceptRole::Exposure => stats.exposures += 1,
                ConceptRole::Outcome => stats.outcomes += 1,
                ConceptRole::Mediator => stats.mediators += 1,
                ConceptRole::Unclassified => stats.unclassified += 1,
            }
            stats.max_depth = stats.max_depth.max(node.depth);
        }
        stats
    }

    pub fn to_archive(&self) -> GraphArchive {
        GraphArchive {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Rebuild a graph from its archive form, checking referential integrity
    pub fn from_archive(archive: GraphArchive) -> Result<Self> {
        let mut graph = Self::new();
        for node in archive.nodes {
            let id = node.id.clone();
            if !graph.insert_node(node) {
                return Err(Error::ArtifactFormat(format!("duplicate node {}", id)));
            }
        }
        for edge in archive.edges {
            graph
                .put_edge(edge)
                .map_err(|e| Error::ArtifactFormat(e.to_string()))?;
        }
        Ok(graph)
    }
}
