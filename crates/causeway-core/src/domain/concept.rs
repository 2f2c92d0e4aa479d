//! Concept nodes of the causal graph
//!
//! A concept is identified by a CUI-like identifier (one letter followed by
//! seven digits) and carries a human-readable name plus a role tag.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static CONCEPT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][0-9]{7}$").expect("static pattern compiles"));

/// Stable identifier of a medical/biological concept
///
/// Construction always validates the format, so any `ConceptId` in memory is
/// safe to bind into a predication query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConceptId(String);

impl ConceptId {
    /// Parse and validate an identifier
    ///
    /// The letter is stored in upper case, which is how the predication
    /// store spells identifiers; `c0021368` and `C0021368` are one concept.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if CONCEPT_ID_PATTERN.is_match(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(Error::InvalidConceptId(raw.to_string()))
        }
    }

    /// Parse a list of identifiers, failing on the first malformed entry
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>> {
        raw.iter().map(|s| Self::parse(s.as_ref())).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConceptId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConceptId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ConceptId> for String {
    fn from(id: ConceptId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConceptId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Role of a concept within the causal question being studied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptRole {
    /// Seed cause under study
    Exposure,
    /// Seed effect under study
    Outcome,
    /// Any concept discovered during expansion
    Mediator,
    /// Concept with no role information (e.g. loaded from a bare artifact)
    Unclassified,
}

impl ConceptRole {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exposure => "exposure",
            Self::Outcome => "outcome",
            Self::Mediator => "mediator",
            Self::Unclassified => "unclassified",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exposure" => Some(Self::Exposure),
            "outcome" => Some(Self::Outcome),
            "mediator" => Some(Self::Mediator),
            "unclassified" => Some(Self::Unclassified),
            _ => None,
        }
    }

    /// Whether the role was assigned from the seed configuration
    pub fn is_seed(&self) -> bool {
        matches!(self, Self::Exposure | Self::Outcome)
    }
}

impl fmt::Display for ConceptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the causal graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Stable identifier
    pub id: ConceptId,
    /// Preferred name as reported by the predication store
    pub name: String,
    /// Role tag, assigned once at creation and rewritten only by consolidation
    pub role: ConceptRole,
    /// Hop at which the concept was first reached (seeds are hop 0)
    pub depth: u32,
    /// Identifiers of concepts merged into this one by consolidation
    #[serde(default)]
    pub merged: Vec<ConceptId>,
}

impl Concept {
    /// Create a seed concept; the name is filled in once a row mentions it
    pub fn seed(id: ConceptId, role: ConceptRole) -> Self {
        Self {
            id,
            name: String::new(),
            role,
            depth: 0,
            merged: Vec::new(),
        }
    }

    /// Create a concept discovered during expansion
    pub fn discovered(id: ConceptId, name: impl Into<String>, depth: u32) -> Self {
        Self {
            id,
            name: name.into(),
            role: ConceptRole::Mediator,
            depth,
            merged: Vec::new(),
        }
    }

    /// Set the role
    pub fn with_role(mut self, role: ConceptRole) -> Self {
        self.role = role;
        self
    }

    /// Name to show in artifacts, falling back to the identifier
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Identifier-safe form of the display name
    ///
    /// Runs of non-alphanumeric characters collapse to a single underscore;
    /// names starting with a digit get a leading underscore.
    pub fn sanitized_name(&self) -> String {
        sanitize_name(self.display_name())
    }
}

/// Convert a free-text name into an identifier-safe token
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }

    if out.is_empty() {
        return "_".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_id_validation() {
        assert!(ConceptId::parse("C0020538").is_ok());
        assert!(ConceptId::parse(" C0002395 ").is_ok());
        assert!(ConceptId::parse("C002053").is_err());
        assert!(ConceptId::parse("00020538").is_err());
        assert!(ConceptId::parse("C00205381").is_err());
        assert!(ConceptId::parse("C0020538'; DROP TABLE x; --").is_err());
    }

    #[test]
    fn test_concept_id_is_upper_cased() {
        let lower = ConceptId::parse("c0021368").unwrap();
        assert_eq!(lower.as_str(), "C0021368");
        assert_eq!(lower, ConceptId::parse("C0021368").unwrap());

        let decoded: ConceptId = serde_json::from_str("\"c0011849\"").unwrap();
        assert_eq!(decoded.as_str(), "C0011849");
    }

    #[test]
    fn test_parse_all_reports_offender() {
        let err = ConceptId::parse_all(&["C0020538", "bogus"]).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_concept_id_serde_validates() {
        let ok: ConceptId = serde_json::from_str("\"C0011849\"").unwrap();
        assert_eq!(ok.as_str(), "C0011849");
        assert!(serde_json::from_str::<ConceptId>("\"nope\"").is_err());
    }

    #[test]
    fn test_role_parse_roundtrip() {
        for role in [
            ConceptRole::Exposure,
            ConceptRole::Outcome,
            ConceptRole::Mediator,
            ConceptRole::Unclassified,
        ] {
            assert_eq!(ConceptRole::parse(role.as_str()), Some(role));
        }
        assert!(ConceptRole::Exposure.is_seed());
        assert!(!ConceptRole::Mediator.is_seed());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Myocardial Infarction"), "Myocardial_Infarction");
        assert_eq!(sanitize_name("Alzheimer's Disease"), "Alzheimer_s_Disease");
        assert_eq!(sanitize_name("  IL-6 / TNF  "), "IL_6_TNF");
        assert_eq!(sanitize_name("5-HT"), "_5_HT");
        assert_eq!(sanitize_name("???"), "_");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let seed = Concept::seed(ConceptId::parse("C0020538").unwrap(), ConceptRole::Exposure);
        assert_eq!(seed.display_name(), "C0020538");
        assert_eq!(seed.depth, 0);
    }
}
