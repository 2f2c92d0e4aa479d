//! Configuration management with file persistence
//!
//! The TOML file is deserialized into loosely-checked section structs; a
//! single [`Config::validate`] pass turns them into [`GraphSettings`], the
//! typed form the engine consumes. Nothing issues a query before that pass
//! has succeeded.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CAUSES, ConceptId};
use crate::error::{Error, Result};

/// Default config file name in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "causeway.toml";

/// Causeway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub graph: GraphConfig,
    pub consolidation: ConsolidationConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
}

/// Predication store connection descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "semmed".to_string(),
            password: None,
            database: "semmeddb".to_string(),
            schema: "public".to_string(),
            table: "causalpredication".to_string(),
            max_connections: 8,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the password from the environment
    pub fn resolved_password(&self) -> Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var("CAUSEWAY_DB_PASSWORD").ok())
    }

    pub fn enforce_env_only(&self) -> Result<()> {
        if self.password.is_some() {
            return Err(Error::invalid_config(
                "database.password",
                "passwords must be provided via CAUSEWAY_DB_PASSWORD, not stored in configuration",
            ));
        }
        Ok(())
    }
}

/// Expansion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub exposures: Vec<String>,
    pub outcomes: Vec<String>,
    pub blocklist: Vec<String>,
    pub max_hops: u32,
    pub degree_threshold: u32,
    pub predicates: Vec<String>,
    pub frontier_batch_size: usize,
    pub max_parallel_queries: usize,
    pub query_retries: u32,
    pub max_rows: Option<u64>,
    pub max_duration_secs: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            exposures: Vec::new(),
            outcomes: Vec::new(),
            blocklist: Vec::new(),
            max_hops: 2,
            degree_threshold: 50,
            predicates: vec![CAUSES.to_string()],
            frontier_batch_size: 200,
            max_parallel_queries: 4,
            query_retries: 3,
            max_rows: None,
            max_duration_secs: None,
        }
    }
}

/// Similarity-based node consolidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            max_concurrency: 4,
            call_timeout_secs: 120,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "openai/gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.0,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("CAUSEWAY_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn enforce_env_only(&self) -> Result<()> {
        if self.api_key.is_some() {
            return Err(Error::invalid_config(
                "llm.api_key",
                "API keys must be provided via environment variables, not stored in configuration",
            ));
        }
        Ok(())
    }
}

/// Where artifacts and the cache are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub stem: String,
    pub cache_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            stem: "causal_graph".to_string(),
            cache_dir: None,
        }
    }
}

impl OutputConfig {
    /// Cache directory, defaulting to the user cache dir
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .map(|d| d.join("causeway"))
                .unwrap_or_else(|| self.directory.join(".cache")),
        }
    }
}

/// Validated expansion settings
///
/// Produced only by [`Config::validate`]; every identifier is well formed
/// and every limit is positive.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSettings {
    pub exposures: Vec<ConceptId>,
    pub outcomes: Vec<ConceptId>,
    pub blocklist: BTreeSet<ConceptId>,
    pub max_hops: NonZeroU32,
    pub degree_threshold: NonZeroU32,
    pub predicates: Vec<String>,
    pub frontier_batch_size: usize,
    pub max_parallel_queries: usize,
    pub query_retries: u32,
    pub max_rows: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl GraphSettings {
    /// Seeds in declaration order, exposures first
    pub fn seeds(&self) -> impl Iterator<Item = &ConceptId> {
        self.exposures.iter().chain(self.outcomes.iter())
    }
}

impl Config {
    /// Load configuration from the given path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Load from `CAUSEWAY_CONFIG` or `causeway.toml`, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn config_path() -> PathBuf {
        env::var("CAUSEWAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.database.enforce_env_only()?;
        self.llm.enforce_env_only()?;

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate the whole configuration in one pass
    pub fn validate(&self) -> Result<GraphSettings> {
        self.database.enforce_env_only()?;
        self.llm.enforce_env_only()?;

        check_sql_identifier("database.schema", &self.database.schema)?;
        check_sql_identifier("database.table", &self.database.table)?;
        if self.database.max_connections == 0 {
            return Err(Error::invalid_config(
                "database.max_connections",
                "must be at least 1",
            ));
        }

        let graph = &self.graph;
        let exposures = parse_ids("graph.exposures", &graph.exposures)?;
        let outcomes = parse_ids("graph.outcomes", &graph.outcomes)?;
        if exposures.is_empty() && outcomes.is_empty() {
            return Err(Error::invalid_config(
                "graph.exposures",
                "at least one exposure or outcome seed is required",
            ));
        }
        let blocklist: BTreeSet<ConceptId> = parse_ids("graph.blocklist", &graph.blocklist)?
            .into_iter()
            .collect();
        if let Some(seed) = exposures.iter().chain(&outcomes).find(|s| blocklist.contains(*s)) {
            return Err(Error::invalid_config(
                "graph.blocklist",
                format!("seed {} is also blocklisted", seed),
            ));
        }

        let max_hops = NonZeroU32::new(graph.max_hops)
            .ok_or_else(|| Error::invalid_config("graph.max_hops", "must be a positive integer"))?;
        let degree_threshold = NonZeroU32::new(graph.degree_threshold).ok_or_else(|| {
            Error::invalid_config("graph.degree_threshold", "must be a positive integer")
        })?;

        let predicates: Vec<String> = graph
            .predicates
            .iter()
            .map(|p| p.trim().to_uppercase())
            .filter(|p| !p.is_empty())
            .collect();
        if predicates.is_empty() {
            return Err(Error::invalid_config(
                "graph.predicates",
                "at least one causal predicate label is required",
            ));
        }
        if graph.frontier_batch_size == 0 {
            return Err(Error::invalid_config(
                "graph.frontier_batch_size",
                "must be at least 1",
            ));
        }
        if graph.max_parallel_queries == 0 {
            return Err(Error::invalid_config(
                "graph.max_parallel_queries",
                "must be at least 1",
            ));
        }
        if graph.query_retries == 0 {
            return Err(Error::invalid_config(
                "graph.query_retries",
                "must allow at least one attempt",
            ));
        }

        let consolidation = &self.consolidation;
        if consolidation.enabled {
            if consolidation.batch_size < 2 {
                return Err(Error::invalid_config(
                    "consolidation.batch_size",
                    "must be at least 2 to compare anything",
                ));
            }
            if consolidation.max_concurrency == 0 {
                return Err(Error::invalid_config(
                    "consolidation.max_concurrency",
                    "must be at least 1",
                ));
            }
            if consolidation.call_timeout_secs == 0 {
                return Err(Error::invalid_config(
                    "consolidation.call_timeout_secs",
                    "must be positive",
                ));
            }
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::invalid_config(
                "llm.temperature",
                "must be between 0.0 and 2.0",
            ));
        }
        if self.output.stem.trim().is_empty() {
            return Err(Error::invalid_config("output.stem", "must not be empty"));
        }

        Ok(GraphSettings {
            exposures,
            outcomes,
            blocklist,
            max_hops,
            degree_threshold,
            predicates,
            frontier_batch_size: graph.frontier_batch_size,
            max_parallel_queries: graph.max_parallel_queries,
            query_retries: graph.query_retries,
            max_rows: graph.max_rows,
            max_duration: graph.max_duration_secs.map(Duration::from_secs),
        })
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "database.host" => self.database.host.clone(),
            "database.port" => self.database.port.to_string(),
            "database.user" => self.database.user.clone(),
            "database.database" => self.database.database.clone(),
            "database.schema" => self.database.schema.clone(),
            "database.table" => self.database.table.clone(),
            "database.max_connections" => self.database.max_connections.to_string(),

            "graph.exposures" => self.graph.exposures.join(", "),
            "graph.outcomes" => self.graph.outcomes.join(", "),
            "graph.blocklist" => self.graph.blocklist.join(", "),
            "graph.max_hops" => self.graph.max_hops.to_string(),
            "graph.degree_threshold" => self.graph.degree_threshold.to_string(),
            "graph.predicates" => self.graph.predicates.join(", "),
            "graph.frontier_batch_size" => self.graph.frontier_batch_size.to_string(),
            "graph.max_parallel_queries" => self.graph.max_parallel_queries.to_string(),
            "graph.query_retries" => self.graph.query_retries.to_string(),

            "consolidation.enabled" => self.consolidation.enabled.to_string(),
            "consolidation.batch_size" => self.consolidation.batch_size.to_string(),
            "consolidation.max_concurrency" => self.consolidation.max_concurrency.to_string(),
            "consolidation.call_timeout_secs" => self.consolidation.call_timeout_secs.to_string(),

            "llm.model" => self.llm.model.clone(),
            "llm.temperature" => self.llm.temperature.to_string(),
            "llm.api_key" => match self.llm.resolved_api_key()? {
                Some(key) if key.len() > 4 => format!("***{}", &key[key.len() - 4..]),
                Some(_) => "***".to_string(),
                None => "(not set - use CAUSEWAY_API_KEY or OPENROUTER_API_KEY env var)".to_string(),
            },

            "output.directory" => self.output.directory.display().to_string(),
            "output.stem" => self.output.stem.clone(),
            "output.cache_dir" => self.output.resolved_cache_dir().display().to_string(),

            _ => {
                return Err(Error::ConfigError(format!(
                    "Unknown configuration key: {}. Use `causeway config list` to see available keys.",
                    key
                )));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "database.host" => self.database.host = value.to_string(),
            "database.port" => self.database.port = parse_value(key, value)?,
            "database.user" => self.database.user = value.to_string(),
            "database.database" => self.database.database = value.to_string(),
            "database.schema" => self.database.schema = value.to_string(),
            "database.table" => self.database.table = value.to_string(),
            "database.max_connections" => self.database.max_connections = parse_value(key, value)?,

            "graph.exposures" => self.graph.exposures = split_list(value),
            "graph.outcomes" => self.graph.outcomes = split_list(value),
            "graph.blocklist" => self.graph.blocklist = split_list(value),
            "graph.max_hops" => self.graph.max_hops = parse_value(key, value)?,
            "graph.degree_threshold" => self.graph.degree_threshold = parse_value(key, value)?,
            "graph.predicates" => self.graph.predicates = split_list(value),
            "graph.frontier_batch_size" => {
                self.graph.frontier_batch_size = parse_value(key, value)?
            }
            "graph.max_parallel_queries" => {
                self.graph.max_parallel_queries = parse_value(key, value)?
            }
            "graph.query_retries" => self.graph.query_retries = parse_value(key, value)?,

            "consolidation.enabled" => self.consolidation.enabled = parse_value(key, value)?,
            "consolidation.batch_size" => self.consolidation.batch_size = parse_value(key, value)?,
            "consolidation.max_concurrency" => {
                self.consolidation.max_concurrency = parse_value(key, value)?
            }
            "consolidation.call_timeout_secs" => {
                self.consolidation.call_timeout_secs = parse_value(key, value)?
            }

            "llm.model" => self.llm.model = value.to_string(),
            "llm.temperature" => self.llm.temperature = parse_value(key, value)?,
            "llm.api_key" => {
                return Err(Error::ConfigError(
                    "API keys cannot be stored in config. Set CAUSEWAY_API_KEY instead.".to_string(),
                ));
            }

            "output.directory" => self.output.directory = PathBuf::from(value),
            "output.stem" => self.output.stem = value.to_string(),
            "output.cache_dir" => self.output.cache_dir = Some(PathBuf::from(value)),

            _ => {
                return Err(Error::ConfigError(format!(
                    "Unknown configuration key: {}. Use `causeway config list` to see available keys.",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Keys accepted by [`get`](Self::get) and [`set`](Self::set)
    pub fn keys() -> &'static [&'static str] {
        &[
            "database.host",
            "database.port",
            "database.user",
            "database.database",
            "database.schema",
            "database.table",
            "database.max_connections",
            "graph.exposures",
            "graph.outcomes",
            "graph.blocklist",
            "graph.max_hops",
            "graph.degree_threshold",
            "graph.predicates",
            "graph.frontier_batch_size",
            "graph.max_parallel_queries",
            "graph.query_retries",
            "consolidation.enabled",
            "consolidation.batch_size",
            "consolidation.max_concurrency",
            "consolidation.call_timeout_secs",
            "llm.model",
            "llm.temperature",
            "llm.api_key",
            "output.directory",
            "output.stem",
            "output.cache_dir",
        ]
    }
}

fn parse_ids(field: &str, raw: &[String]) -> Result<Vec<ConceptId>> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::with_capacity(raw.len());
    for value in raw {
        let id = ConceptId::parse(value)
            .map_err(|_| Error::invalid_config(field, format!("malformed concept identifier '{}'", value)))?;
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn check_sql_identifier(field: &str, value: &str) -> Result<()> {
    let valid = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_config(
            field,
            format!("'{}' is not a plain SQL identifier", value),
        ))
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(key, format!("invalid value '{}'", value)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Config {
        let mut config = Config::default();
        config.graph.exposures = vec!["C0020538".to_string()];
        config.graph.outcomes = vec!["C0002395".to_string()];
        config
    }

    #[test]
    fn test_validate_produces_settings() {
        let settings = seeded().validate().unwrap();
        assert_eq!(settings.exposures[0].as_str(), "C0020538");
        assert_eq!(settings.outcomes[0].as_str(), "C0002395");
        assert_eq!(settings.max_hops.get(), 2);
        assert_eq!(settings.predicates, vec!["CAUSES".to_string()]);
        assert_eq!(settings.seeds().count(), 2);
    }

    #[test]
    fn test_validate_requires_seeds() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "graph.exposures"));
    }

    #[test]
    fn test_validate_rejects_malformed_identifier() {
        let mut config = seeded();
        config.graph.blocklist = vec!["C12".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "graph.blocklist"));
    }

    #[test]
    fn test_validate_rejects_non_positive_limits() {
        let mut config = seeded();
        config.graph.degree_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "graph.degree_threshold"));

        let mut config = seeded();
        config.graph.max_hops = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blocklisted_seed() {
        let mut config = seeded();
        config.graph.blocklist = vec!["C0020538".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lower_case_identifiers_match_store_spelling() {
        let mut config = seeded();
        config.graph.exposures = vec!["c0020538".to_string()];
        config.graph.blocklist = vec!["c0021368".to_string()];
        let settings = config.validate().unwrap();

        assert_eq!(settings.exposures[0].as_str(), "C0020538");
        assert!(settings.blocklist.contains(&ConceptId::parse("C0021368").unwrap()));

        let mut config = seeded();
        config.graph.blocklist = vec!["c0020538".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "graph.blocklist"));
    }

    #[test]
    fn test_validate_rejects_unsafe_table_name() {
        let mut config = seeded();
        config.database.table = "predication; DROP".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "database.table"));
    }

    #[test]
    fn test_inline_password_is_rejected() {
        let mut config = seeded();
        config.database.password = Some("hunter2".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_seeds_are_collapsed() {
        let mut config = seeded();
        config.graph.exposures = vec!["C0020538".to_string(), "C0020538".to_string()];
        assert_eq!(config.validate().unwrap().exposures.len(), 1);
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [graph]
            exposures = ["C0020538"]
            outcomes = ["C0002395"]
            max_hops = 1
            degree_threshold = 50

            [consolidation]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.graph.max_hops, 1);
        assert!(!config.consolidation.enabled);
        assert_eq!(config.database.port, 5432);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_get_and_set() {
        let mut config = seeded();
        config.set("graph.degree_threshold", "7").unwrap();
        assert_eq!(config.get("graph.degree_threshold").unwrap(), "7");

        config.set("graph.blocklist", "C0000001, C0000002").unwrap();
        assert_eq!(config.graph.blocklist.len(), 2);

        assert!(config.set("graph.max_hops", "many").is_err());
        assert!(config.set("llm.api_key", "sk-secret").is_err());
        assert!(config.get("nope").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("causeway.toml");
        seeded().save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.graph.exposures, vec!["C0020538".to_string()]);
    }
}
