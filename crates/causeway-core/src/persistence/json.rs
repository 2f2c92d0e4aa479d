//! JSON assertion listing

use serde::{Deserialize, Serialize};

use super::GraphEncoder;
use crate::domain::{CausalGraph, ConceptId};
use crate::error::Result;

/// One edge with its endpoint names and provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub subject_cui: String,
    pub subject_name: String,
    pub predicate: String,
    pub object_cui: String,
    pub object_name: String,
    pub evidence_count: u32,
    pub citations: Vec<String>,
    pub hop: u32,
    pub confidence: f64,
}

/// Writes the edge set as a JSON array, in edge-key order
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAssertionEncoder;

impl JsonAssertionEncoder {
    pub fn records(&self, graph: &CausalGraph) -> Vec<AssertionRecord> {
        let name_of = |id: &ConceptId| {
            graph
                .node(id)
                .map(|n| n.display_name().to_string())
                .unwrap_or_default()
        };
        graph
            .edges()
            .map(|edge| AssertionRecord {
                subject_cui: edge.subject.to_string(),
                subject_name: name_of(&edge.subject),
                predicate: edge.predicate.clone(),
                object_cui: edge.object.to_string(),
                object_name: name_of(&edge.object),
                evidence_count: edge.provenance.evidence_count,
                citations: edge.provenance.citations.iter().cloned().collect(),
                hop: edge.provenance.hop,
                confidence: edge.provenance.confidence(),
            })
            .collect()
    }
}

impl GraphEncoder for JsonAssertionEncoder {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode(&self, graph: &CausalGraph) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(&self.records(graph))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
