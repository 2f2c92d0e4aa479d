//! Domain model: concepts, causal assertions and the graph that holds them

mod assertion;
mod concept;
mod graph;

pub use assertion::{Assertion, CAUSES, MAX_CITATIONS, Provenance};
pub use concept::{Concept, ConceptId, ConceptRole, sanitize_name};
pub use graph::{CausalGraph, EdgeKey, GraphArchive, GraphStats};
