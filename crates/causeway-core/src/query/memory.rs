//! In-memory predication store
//!
//! Evaluates a [`PredicationQuery`] over raw predication records with the
//! same semantics as the SQL statement: predicate filter, scope filter,
//! blocklist on both endpoints, aggregation per `(subject, object)` pair and
//! the per-subject degree cap ranked by evidence. Parameters are read
//! positionally, so a misordered query fails here exactly as it would
//! against Postgres.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::builder::{PredicationQuery, QueryScope};
use super::store::{PredicationRow, PredicationStore, StoreError};
use crate::domain::{CAUSES, MAX_CITATIONS};
use crate::error::{Error, Result};

/// One raw predication: a single citation asserting `subject predicate object`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicationRecord {
    pub subject_cui: String,
    pub subject_name: String,
    pub predicate: String,
    pub object_cui: String,
    pub object_name: String,
    pub pmid: String,
}

/// Predication store held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryPredicationStore {
    records: Vec<PredicationRecord>,
    max_connections: usize,
    fetches: AtomicUsize,
    failures: Mutex<VecDeque<StoreError>>,
}

impl InMemoryPredicationStore {
    pub fn new(records: Vec<PredicationRecord>) -> Self {
        Self {
            records,
            max_connections: 4,
            fetches: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Load records from a JSON array fixture
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let records: Vec<PredicationRecord> = serde_json::from_str(&contents).map_err(|e| {
            Error::ConfigError(format!("Invalid predication fixture {}: {}", path.display(), e))
        })?;
        Ok(Self::new(records))
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Add `evidence` distinct citations of `subject CAUSES object`
    pub fn add_causes(
        &mut self,
        subject: (&str, &str),
        object: (&str, &str),
        evidence: u32,
    ) -> &mut Self {
        self.add(subject, CAUSES, object, evidence)
    }

    /// Add `evidence` distinct citations of `subject predicate object`
    pub fn add(
        &mut self,
        subject: (&str, &str),
        predicate: &str,
        object: (&str, &str),
        evidence: u32,
    ) -> &mut Self {
        for n in 0..evidence {
            self.records.push(PredicationRecord {
                subject_cui: subject.0.to_string(),
                subject_name: subject.1.to_string(),
                predicate: predicate.to_string(),
                object_cui: object.0.to_string(),
                object_name: object.1.to_string(),
                pmid: format!("{}{}{:04}", subject.0, object.0, n),
            });
        }
        self
    }

    /// Make the next `fetch` calls fail with the given errors, in order
    pub async fn inject_failures(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures.lock().await.extend(errors);
    }

    /// Number of `fetch` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> &[PredicationRecord] {
        &self.records
    }

    fn evaluate(&self, query: &PredicationQuery) -> std::result::Result<Vec<PredicationRow>, StoreError> {
        query
            .check_binding_order()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let predicates: HashSet<&str> = query.predicates().iter().map(String::as_str).collect();
        let frontier: HashSet<&str> = query.frontier().iter().map(String::as_str).collect();
        let blocklist: HashSet<&str> = query.blocklist().iter().map(String::as_str).collect();
        let threshold = usize::try_from(query.degree_threshold()).unwrap_or(0);

        struct Pair<'a> {
            subject_name: &'a str,
            object_name: &'a str,
            predicate: &'a str,
            pmids: BTreeSet<&'a str>,
        }

        let mut pairs: BTreeMap<(&str, &str), Pair<'_>> = BTreeMap::new();
        for record in &self.records {
            if !predicates.contains(record.predicate.as_str()) {
                continue;
            }
            let in_scope = match query.scope {
                QueryScope::Seed => {
                    frontier.contains(record.subject_cui.as_str())
                        || frontier.contains(record.object_cui.as_str())
                }
                QueryScope::Frontier => frontier.contains(record.subject_cui.as_str()),
            };
            if !in_scope
                || blocklist.contains(record.subject_cui.as_str())
                || blocklist.contains(record.object_cui.as_str())
            {
                continue;
            }

            let pair = pairs
                .entry((record.subject_cui.as_str(), record.object_cui.as_str()))
                .or_insert_with(|| Pair {
                    subject_name: &record.subject_name,
                    object_name: &record.object_name,
                    predicate: &record.predicate,
                    pmids: BTreeSet::new(),
                });
            pair.subject_name = pair.subject_name.max(record.subject_name.as_str());
            pair.object_name = pair.object_name.max(record.object_name.as_str());
            pair.predicate = pair.predicate.min(record.predicate.as_str());
            pair.pmids.insert(&record.pmid);
        }

        let mut by_subject: BTreeMap<&str, Vec<PredicationRow>> = BTreeMap::new();
        for ((subject, object), pair) in pairs {
            by_subject.entry(subject).or_default().push(PredicationRow {
                subject_cui: subject.to_string(),
                subject_name: pair.subject_name.to_string(),
                predicate: pair.predicate.to_string(),
                object_cui: object.to_string(),
                object_name: pair.object_name.to_string(),
                evidence_count: pair.pmids.len() as i64,
                citations: pair
                    .pmids
                    .iter()
                    .take(MAX_CITATIONS)
                    .map(|p| p.to_string())
                    .collect(),
            });
        }

        let mut rows = Vec::new();
        for (_, mut candidates) in by_subject {
            candidates.sort_by(|a, b| {
                b.evidence_count
                    .cmp(&a.evidence_count)
                    .then_with(|| a.object_cui.cmp(&b.object_cui))
            });
            candidates.truncate(threshold);
            rows.extend(candidates);
        }
        Ok(rows)
    }
}

#[async_trait]
impl PredicationStore for InMemoryPredicationStore {
    async fn fetch(&self, query: &PredicationQuery) -> std::result::Result<Vec<PredicationRow>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        self.evaluate(query)
    }

    fn max_connections(&self) -> usize {
        self.max_connections.max(1)
    }

    fn name(&self) -> &str {
        "memory"
    }

    /// Digest of every record, so a changed fixture is a different source
    fn source(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            for field in [
                &record.subject_cui,
                &record.subject_name,
                &record.predicate,
                &record.object_cui,
                &record.object_name,
                &record.pmid,
            ] {
                hasher.update(field.as_bytes());
                hasher.update([0u8]);
            }
        }
        format!("memory:{}", hex::encode(hasher.finalize()))
    }
}
