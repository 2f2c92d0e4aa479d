//! Structured DAG text format
//!
//! ```text
//! dag {
//! Hypertension [exposure,cui="C0020538"]
//! Alzheimer_s_Disease [outcome,cui="C0002395"]
//! Inflammation [cui="C0021368"]
//! Hypertension -> Inflammation
//! Inflammation -> Alzheimer_s_Disease
//! }
//! ```
//!
//! Node labels are sanitized names; when two nodes sanitize to the same
//! label the later one (in identifier order) gets a numeric suffix. Mediators
//! carry no role annotation. The `cui` attribute is what makes the format
//! loadable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use super::{GraphDecoder, GraphEncoder};
use crate::domain::{Assertion, CAUSES, CausalGraph, Concept, ConceptId, ConceptRole};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct DagTextCodec;

impl DagTextCodec {
    /// Unique label per node, assigned in identifier order
    pub fn labels(graph: &CausalGraph) -> BTreeMap<ConceptId, String> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut labels = BTreeMap::new();
        for node in graph.nodes() {
            let base = node.sanitized_name();
            let count = counts.entry(base.clone()).or_insert(0);
            *count += 1;
            let mut label = if *count == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, count)
            };
            // a suffixed label may collide with a real name
            while taken.contains(&label) {
                *count += 1;
                label = format!("{}_{}", base, count);
            }
            taken.insert(label.clone());
            labels.insert(node.id.clone(), label);
        }
        labels
    }

    pub fn render(&self, graph: &CausalGraph) -> String {
        let labels = Self::labels(graph);
        let mut out = String::from("dag {\n");

        for node in graph.nodes() {
            let label = &labels[&node.id];
            let _ = match node.role {
                ConceptRole::Mediator => writeln!(out, "{} [cui=\"{}\"]", label, node.id),
                role => writeln!(out, "{} [{},cui=\"{}\"]", label, role.as_str(), node.id),
            };
        }
        for edge in graph.edges() {
            let _ = writeln!(out, "{} -> {}", labels[&edge.subject], labels[&edge.object]);
        }

        out.push_str("}\n");
        out
    }

    pub fn parse(&self, text: &str) -> Result<CausalGraph> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty());

        match lines.next() {
            Some((_, "dag {")) => {}
            _ => return Err(Error::ArtifactFormat("expected `dag {` header".to_string())),
        }

        let mut graph = CausalGraph::new();
        let mut by_label: HashMap<String, ConceptId> = HashMap::new();
        let mut closed = false;

        for (index, line) in lines {
            let line_no = index + 1;
            if closed {
                return Err(Error::ArtifactFormat(format!(
                    "line {}: content after closing brace",
                    line_no
                )));
            }
            if line == "}" {
                closed = true;
                continue;
            }

            if let Some((left, right)) = line.split_once("->") {
                let subject = resolve_label(&by_label, left.trim(), line_no)?;
                let object = resolve_label(&by_label, right.trim(), line_no)?;
                graph.put_edge(Assertion::new(subject, object, CAUSES, 0, 0))?;
                continue;
            }

            let (label, concept) = parse_node(line, line_no)?;
            if by_label.insert(label.clone(), concept.id.clone()).is_some() {
                return Err(Error::ArtifactFormat(format!(
                    "line {}: duplicate node label {}",
                    line_no, label
                )));
            }
            if !graph.insert_node(concept) {
                return Err(Error::ArtifactFormat(format!(
                    "line {}: duplicate concept for label {}",
                    line_no, label
                )));
            }
        }

        if !closed {
            return Err(Error::ArtifactFormat("missing closing brace".to_string()));
        }
        Ok(graph)
    }
}

fn resolve_label(by_label: &HashMap<String, ConceptId>, label: &str, line_no: usize) -> Result<ConceptId> {
    by_label.get(label).cloned().ok_or_else(|| {
        Error::ArtifactFormat(format!("line {}: edge references undeclared node {}", line_no, label))
    })
}

fn parse_node(line: &str, line_no: usize) -> Result<(String, Concept)> {
    let (label, attrs) = match line.split_once('[') {
        Some((label, rest)) => {
            let attrs = rest.strip_suffix(']').ok_or_else(|| {
                Error::ArtifactFormat(format!("line {}: unterminated attribute list", line_no))
            })?;
            (label.trim(), attrs)
        }
        None => (line, ""),
    };
    if label.is_empty() || label.contains(char::is_whitespace) {
        return Err(Error::ArtifactFormat(format!("line {}: invalid node label", line_no)));
    }

    let mut role = ConceptRole::Mediator;
    let mut cui = None;
    for attr in attrs.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        if let Some(value) = attr.strip_prefix("cui=") {
            let value = value.trim_matches('"');
            cui = Some(ConceptId::parse(value).map_err(|_| {
                Error::ArtifactFormat(format!("line {}: malformed cui {}", line_no, value))
            })?);
        } else if let Some(parsed) = ConceptRole::parse(attr) {
            role = parsed;
        }
    }

    let id = cui.ok_or_else(|| {
        Error::ArtifactFormat(format!("line {}: node {} has no cui attribute", line_no, label))
    })?;
    let name = label.trim_start_matches('_').replace('_', " ");
    let concept = Concept::discovered(id, name, 0).with_role(role);
    Ok((label.to_string(), concept))
}

impl GraphEncoder for DagTextCodec {
    fn extension(&self) -> &'static str {
        "dag"
    }

    fn encode(&self, graph: &CausalGraph) -> Result<Vec<u8>> {
        Ok(self.render(graph).into_bytes())
    }
}

impl GraphDecoder for DagTextCodec {
    fn decode(&self, bytes: &[u8]) -> Result<CausalGraph> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::ArtifactFormat(format!("artifact is not UTF-8: {}", e)))?;
        self.parse(text)
    }
}
