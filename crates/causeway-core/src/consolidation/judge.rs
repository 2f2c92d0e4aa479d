//! Semantic-similarity judges
//!
//! A judge receives one batch of `(identifier, name)` candidates and answers
//! with clusters of identifiers it considers the same clinical entity. The
//! engine treats it as an oracle: any identifier outside the batch is
//! ignored, and a failing call is retried and finally skipped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::ConceptId;
use crate::error::{Error, Result};
use crate::llm::{LlmClient, Message};

/// One concept offered to the judge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConcept {
    pub id: ConceptId,
    pub name: String,
}

/// Capability that clusters equivalent concepts
#[async_trait]
pub trait SimilarityJudge: Send + Sync {
    /// Judge one batch; each returned cluster lists equivalent identifiers
    async fn judge(&self, batch: &[CandidateConcept]) -> Result<Vec<Vec<ConceptId>>>;

    /// Short label for logs
    fn name(&self) -> &str;
}

/// Judge backed by a chat-completion model
#[derive(Clone)]
pub struct LlmSimilarityJudge {
    llm_client: Arc<LlmClient>,
}

impl LlmSimilarityJudge {
    pub fn new(llm_client: Arc<LlmClient>) -> Self {
        Self { llm_client }
    }

    fn build_prompt(&self, batch: &[CandidateConcept]) -> String {
        let mut prompt = String::from(
            "Group the following medical concepts into clusters of concepts that denote the same clinical entity.\n\nConcepts (identifier<TAB>name):\n",
        );
        for candidate in batch {
            prompt.push_str(candidate.id.as_str());
            prompt.push('\t');
            prompt.push_str(&candidate.name);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nRespond with JSON of the form {\"clusters\": [[\"C0000001\", \"C0000002\"]]}. \
             Only list clusters with two or more identifiers. Use identifiers exactly as given.",
        );
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    #[serde(default)]
    clusters: Vec<Vec<String>>,
}

#[async_trait]
impl SimilarityJudge for LlmSimilarityJudge {
    async fn judge(&self, batch: &[CandidateConcept]) -> Result<Vec<Vec<ConceptId>>> {
        let messages = vec![
            Message::system(SIMILARITY_SYSTEM_PROMPT),
            Message::user(self.build_prompt(batch)),
        ];
        let request = self.llm_client.chat_request(messages).with_json_output();
        let response = self.llm_client.execute(&request).await?;

        let clusters = parse_cluster_response(&response.content)?;
        info!(
            candidates = batch.len(),
            clusters = clusters.len(),
            tokens = response.tokens_used,
            "Similarity batch judged"
        );
        Ok(clusters)
    }

    fn name(&self) -> &str {
        self.llm_client.model()
    }
}

/// System prompt for similarity judgments
const SIMILARITY_SYSTEM_PROMPT: &str = r#"You are an expert in clinical terminology.

You decide which concept names are alternate surface forms of the same clinical entity (synonyms, abbreviations, spelling variants, lay terms).

Guidelines:
1. Merge only true synonyms ("Myocardial Infarction" and "Heart Attack")
2. Never merge a broader concept with a narrower one ("Diabetes" and "Type 2 Diabetes")
3. Never merge a condition with its cause, treatment or symptom
4. When unsure, leave the concepts apart

Return valid JSON only, with no additional text or explanation."#;

/// Parse the judge's reply into identifier clusters
///
/// Entries that are not well-formed identifiers are dropped; a reply that
/// is not the expected JSON shape is a [`Error::JudgmentFailed`].
pub fn parse_cluster_response(response: &str) -> Result<Vec<Vec<ConceptId>>> {
    let json = extract_json_from_response(response);
    let parsed: ClusterResponse = serde_json::from_str(&json)
        .map_err(|e| Error::JudgmentFailed(format!("malformed cluster response: {}", e)))?;

    Ok(parsed
        .clusters
        .into_iter()
        .map(|cluster| {
            cluster
                .iter()
                .filter_map(|raw| match ConceptId::parse(raw) {
                    Ok(id) => Some(id),
                    Err(_) => {
                        debug!(raw = %raw, "Dropping malformed identifier from judgment");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|cluster| cluster.len() > 1)
        .collect())
}

/// Extract JSON from a response that might be wrapped in markdown
fn extract_json_from_response(response: &str) -> String {
    if let Some(start) = response.find("```json") {
        let json_start = start + 7;
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim().to_string();
        }
    }

    if let Some(start) = response.find("```") {
        let potential_start = start + 3;
        if let Some(newline) = response[potential_start..].find('\n') {
            let json_start = potential_start + newline + 1;
            if let Some(end) = response[json_start..].find("```") {
                return response[json_start..json_start + end].trim().to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if start < end {
            return response[start..=end].to_string();
        }
    }

    response.to_string()
}

/// Deterministic judge with fixed equivalence groups
///
/// Each group lists identifiers or names (names compare case-insensitively,
/// ignoring punctuation). For a batch, every group answers with the
/// candidates it matches. Useful for offline runs and tests.
#[derive(Debug, Default)]
pub struct FixedJudge {
    groups: Vec<BTreeSet<String>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FixedJudge {
    pub fn new<G, S>(groups: G) -> Self
    where
        G: IntoIterator,
        G::Item: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| group.into_iter().map(|s| normalize(s.as_ref())).collect())
                .collect(),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Judge that never merges anything
    pub fn empty() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[async_trait]
impl SimilarityJudge for FixedJudge {
    async fn judge(&self, batch: &[CandidateConcept]) -> Result<Vec<Vec<ConceptId>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::JudgmentFailed("injected failure".to_string()));
        }

        Ok(self
            .groups
            .iter()
            .map(|group| {
                batch
                    .iter()
                    .filter(|c| {
                        group.contains(&normalize(c.id.as_str())) || group.contains(&normalize(&c.name))
                    })
                    .map(|c| c.id.clone())
                    .collect::<Vec<_>>()
            })
            .filter(|cluster| cluster.len() > 1)
            .collect())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, name: &str) -> CandidateConcept {
        CandidateConcept {
            id: ConceptId::parse(id).unwrap(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_cluster_response_in_code_fence() {
        let response = "Here you go:\n```json\n{\"clusters\": [[\"C0027051\", \"C0018802\"]]}\n```";
        let clusters = parse_cluster_response(response).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0][0].as_str(), "C0027051");
    }

    #[test]
    fn test_parse_drops_malformed_ids_and_singletons() {
        let response = r#"{"clusters": [["C0027051", "heart attack"], ["C0000001", "C0000002", "bad"]]}"#;
        let clusters = parse_cluster_response(response).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_cluster_response("I think they are all different.").unwrap_err();
        assert!(matches!(err, Error::JudgmentFailed(_)));
    }

    #[test]
    fn test_prompt_lists_every_candidate() {
        let client = LlmClient::builder().api_key("k").build().unwrap();
        let judge = LlmSimilarityJudge::new(Arc::new(client));
        let prompt = judge.build_prompt(&[
            candidate("C0027051", "Myocardial Infarction"),
            candidate("C0018802", "Heart Attack"),
        ]);
        assert!(prompt.contains("C0027051\tMyocardial Infarction"));
        assert!(prompt.contains("C0018802\tHeart Attack"));
    }

    #[tokio::test]
    async fn test_fixed_judge_matches_names() {
        let judge = FixedJudge::new([["Myocardial_Infarction", "heart attack"]]);
        let clusters = judge
            .judge(&[
                candidate("C0027051", "Myocardial Infarction"),
                candidate("C0018802", "Heart Attack"),
                candidate("C0020538", "Hypertension"),
            ])
            .await
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[tokio::test]
    async fn test_fixed_judge_failures() {
        let judge = FixedJudge::empty().failing(1);
        assert!(judge.judge(&[]).await.is_err());
        assert!(judge.judge(&[]).await.is_ok());
        assert_eq!(judge.calls(), 2);
    }
}
