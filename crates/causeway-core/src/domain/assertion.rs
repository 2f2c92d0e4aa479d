//! Causal assertions (edges) and their provenance

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::concept::ConceptId;

/// Maximum number of citation identifiers retained per edge
pub const MAX_CITATIONS: usize = 10;

/// Predicate label materialized into graph edges by default
pub const CAUSES: &str = "CAUSES";

/// A directed causal relation between two concepts
///
/// Edges are keyed by `(subject, object)`; observing the same pair again
/// folds into the existing edge instead of creating a parallel one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub subject: ConceptId,
    pub object: ConceptId,
    /// Predicate label as stored in the predication store
    pub predicate: String,
    pub provenance: Provenance,
}

/// Evidence backing an assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Number of distinct citations supporting the pair
    pub evidence_count: u32,
    /// Sample of citation identifiers, sorted and bounded
    pub citations: BTreeSet<String>,
    /// Hop at which the pair was first observed
    pub hop: u32,
}

impl Provenance {
    pub fn new(evidence_count: u32, hop: u32) -> Self {
        Self {
            evidence_count,
            citations: BTreeSet::new(),
            hop,
        }
    }

    /// Confidence derived from evidence volume, in `[0, 1)`
    pub fn confidence(&self) -> f64 {
        let n = f64::from(self.evidence_count);
        n / (n + 1.0)
    }
}

impl Assertion {
    /// Create a new assertion first observed at `hop`
    pub fn new(
        subject: ConceptId,
        object: ConceptId,
        predicate: impl Into<String>,
        evidence_count: u32,
        hop: u32,
    ) -> Self {
        Self {
            subject,
            object,
            predicate: predicate.into(),
            provenance: Provenance::new(evidence_count, hop),
        }
    }

    /// Attach citation identifiers (bounded to [`MAX_CITATIONS`])
    pub fn with_citations<I, S>(mut self, citations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_citations(citations);
        self
    }

    /// Key used for deduplication
    pub fn key(&self) -> (ConceptId, ConceptId) {
        (self.subject.clone(), self.object.clone())
    }

    pub fn is_self_loop(&self) -> bool {
        self.subject == self.object
    }

    /// Fold a re-observation of the same pair into this edge
    ///
    /// Rows already carry the aggregated evidence for the pair, so repeated
    /// observations saturate at the maximum instead of summing. The earliest
    /// hop is kept.
    pub fn observe(&mut self, other: &Assertion) {
        debug_assert_eq!(self.key(), other.key());
        self.provenance.evidence_count = self
            .provenance
            .evidence_count
            .max(other.provenance.evidence_count);
        self.provenance.hop = self.provenance.hop.min(other.provenance.hop);
        self.add_citations(other.provenance.citations.iter().cloned());
    }

    /// Fold a distinct assertion that was rewritten onto this edge by a merge
    ///
    /// Unlike [`observe`](Self::observe) the evidence is independent, so the
    /// counts add.
    pub fn absorb(&mut self, other: &Assertion) {
        self.provenance.evidence_count = self
            .provenance
            .evidence_count
            .saturating_add(other.provenance.evidence_count);
        self.provenance.hop = self.provenance.hop.min(other.provenance.hop);
        self.add_citations(other.provenance.citations.iter().cloned());
    }

    fn add_citations<I, S>(&mut self, citations: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for citation in citations {
            self.provenance.citations.insert(citation.into());
        }
        while self.provenance.citations.len() > MAX_CITATIONS {
            self.provenance.citations.pop_last();
        }
    }
}
