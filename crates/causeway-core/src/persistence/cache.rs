//! Content-addressed graph cache
//!
//! Entries are binary artifacts named after the hash of the run's
//! configuration tuple. Writes go to a temporary file in the cache directory
//! and are renamed into place, so a reader sees either the previous entry or
//! the complete new one. Writers for the same key are serialized by a
//! per-key lock; there is no cross-process lock beyond the rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::binary::{BINARY_FORMAT_VERSION, BinaryCodec};
use super::{GraphDecoder, GraphEncoder, write_atomic};
use crate::config::{DatabaseConfig, GraphSettings};
use crate::domain::CausalGraph;
use crate::error::{Error, Result};

/// Bumped whenever the meaning of a cached graph changes
const CACHE_SCHEMA: &str = "causeway-graph-cache/1";

/// Identity of the predication data a run reads
///
/// `store_source` is the store's own identity (see
/// [`PredicationStore::source`](crate::query::PredicationStore::source));
/// the schema and table are appended since one database can hold several.
pub fn source_id(store_source: &str, database: &DatabaseConfig) -> String {
    format!("{}#{}.{}", store_source, database.schema, database.table)
}

/// Hash of everything that determines the assembled graph
///
/// Seed and blocklist order does not matter; exposures and outcomes are
/// hashed separately since they set roles. `source` comes from
/// [`source_id`], so the same tuple against other data is another entry.
pub fn cache_key(settings: &GraphSettings, consolidated: bool, source: &str) -> String {
    fn sorted<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
        let mut values: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
        values.sort();
        values.dedup();
        values.join(",")
    }

    let mut hasher = Sha256::new();
    hasher.update(CACHE_SCHEMA.as_bytes());
    hasher.update(format!("\nbinary:{}", BINARY_FORMAT_VERSION).as_bytes());
    hasher.update(format!("\nsource:{}", source).as_bytes());
    hasher.update(format!("\nexposures:{}", sorted(&settings.exposures)).as_bytes());
    hasher.update(format!("\noutcomes:{}", sorted(&settings.outcomes)).as_bytes());
    hasher.update(format!("\nblocklist:{}", sorted(&settings.blocklist)).as_bytes());
    hasher.update(format!("\ndegree_threshold:{}", settings.degree_threshold).as_bytes());
    hasher.update(format!("\nmax_hops:{}", settings.max_hops).as_bytes());
    hasher.update(format!("\npredicates:{}", sorted(&settings.predicates)).as_bytes());
    hasher.update(format!("\nconsolidated:{}", consolidated).as_bytes());
    hex::encode(hasher.finalize())
}

/// On-disk cache of assembled graphs
#[derive(Debug)]
pub struct GraphCache {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GraphCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for `key`
    pub fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::CacheError(format!("invalid cache key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.bin", key)))
    }

    /// Look up an entry; an unreadable or corrupt entry is a miss
    pub async fn load(&self, key: &str) -> Result<Option<CausalGraph>> {
        let path = self.entry_path(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "Cache miss");
                return Ok(None);
            }
            Err(e) => {
                warn!(key, error = %e, "Cache entry unreadable, treating as miss");
                return Ok(None);
            }
        };

        match BinaryCodec.decode(&bytes) {
            Ok(graph) => {
                info!(key, nodes = graph.node_count(), edges = graph.edge_count(), "Cache hit");
                Ok(Some(graph))
            }
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "Corrupt cache entry, treating as miss");
                Ok(None)
            }
        }
    }

    /// Write an entry atomically
    pub async fn store(&self, key: &str, graph: &CausalGraph) -> Result<PathBuf> {
        let path = self.entry_path(key)?;
        let bytes = BinaryCodec.encode(graph)?;

        let lock = self.key_lock(key).await;
        let written = {
            let _guard = lock.lock().await;
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_atomic(&target, &bytes)).await
        };
        self.release_key_lock(key, lock).await;
        written.map_err(|e| Error::CacheError(format!("cache writer failed: {}", e)))??;

        info!(key, path = %path.display(), "Cache entry stored");
        Ok(path)
    }

    /// Remove one entry; returns whether it existed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key)?;
        let lock = self.key_lock(key).await;
        let removed = {
            let _guard = lock.lock().await;
            tokio::fs::remove_file(&path).await
        };
        self.release_key_lock(key, lock).await;

        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every entry; returns how many were deleted
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        info!(removed, dir = %self.dir.display(), "Cache cleared");
        Ok(removed)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drop the map entry once no other writer holds or waits on it
    async fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // held by the map and by `lock` only
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        drop(lock);
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Assertion, CAUSES, Concept, ConceptId, ConceptRole};
    use std::collections::BTreeSet;
    use std::num::NonZeroU32;

    const SOURCE: &str = "memory:fixture#public.causalpredication";

    fn id(s: &str) -> ConceptId {
        ConceptId::parse(s).unwrap()
    }

    fn settings() -> GraphSettings {
        GraphSettings {
            exposures: vec![id("C0020538"), id("C0011849")],
            outcomes: vec![id("C0002395")],
            blocklist: BTreeSet::new(),
            max_hops: NonZeroU32::new(2).unwrap(),
            degree_threshold: NonZeroU32::new(50).unwrap(),
            predicates: vec!["CAUSES".to_string()],
            frontier_batch_size: 200,
            max_parallel_queries: 4,
            query_retries: 3,
            max_rows: None,
            max_duration: None,
        }
    }

    fn graph() -> CausalGraph {
        let mut graph = CausalGraph::new();
        graph.insert_node(Concept::seed(id("C0020538"), ConceptRole::Exposure));
        graph.insert_node(Concept::discovered(id("C0021368"), "Inflammation", 1));
        graph
            .put_edge(Assertion::new(id("C0020538"), id("C0021368"), CAUSES, 2, 1))
            .unwrap();
        graph
    }

    #[test]
    fn test_cache_key_ignores_seed_order() {
        let a = settings();
        let mut b = settings();
        b.exposures.reverse();
        assert_eq!(cache_key(&a, true, SOURCE), cache_key(&b, true, SOURCE));
        assert_eq!(cache_key(&a, true, SOURCE).len(), 64);
    }

    #[test]
    fn test_cache_key_tracks_the_tuple() {
        let base = cache_key(&settings(), true, SOURCE);

        let mut s = settings();
        s.degree_threshold = NonZeroU32::new(49).unwrap();
        assert_ne!(cache_key(&s, true, SOURCE), base);

        let mut s = settings();
        s.max_hops = NonZeroU32::new(3).unwrap();
        assert_ne!(cache_key(&s, true, SOURCE), base);

        let mut s = settings();
        s.blocklist.insert(id("C0000001"));
        assert_ne!(cache_key(&s, true, SOURCE), base);

        // moving a seed from exposure to outcome changes roles
        let mut s = settings();
        let moved = s.exposures.pop().unwrap();
        s.outcomes.push(moved);
        assert_ne!(cache_key(&s, true, SOURCE), base);

        assert_ne!(cache_key(&settings(), false, SOURCE), base);

        assert_ne!(cache_key(&settings(), true, "postgres://db:5432/semmed#public.causalpredication"), base);

        // budgets do not change the key
        let mut s = settings();
        s.frontier_batch_size = 10;
        assert_eq!(cache_key(&s, true, SOURCE), base);
    }

    #[test]
    fn test_source_id_names_schema_and_table() {
        let mut database = DatabaseConfig::default();
        database.schema = "semmed".to_string();
        database.table = "predication_v43".to_string();
        assert_eq!(source_id("memory:abc", &database), "memory:abc#semmed.predication_v43");
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GraphCache::new(dir.path().join("cache"));
        let key = cache_key(&settings(), true, SOURCE);

        assert!(cache.load(&key).await.unwrap().is_none());
        let path = cache.store(&key, &graph()).await.unwrap();
        assert!(path.exists());
        assert_eq!(cache.load(&key).await.unwrap(), Some(graph()));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GraphCache::new(dir.path());
        let key = cache_key(&settings(), true, SOURCE);

        std::fs::write(cache.entry_path(&key).unwrap(), b"CWG1 garbage").unwrap();
        assert!(cache.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_one_complete_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(GraphCache::new(dir.path()));
        let key = cache_key(&settings(), true, SOURCE);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.store(&key, &graph()).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(cache.load(&key).await.unwrap(), Some(graph()));
        assert_eq!(cache.lock_count().await, 0);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_none_or(|ext| ext != "bin"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GraphCache::new(dir.path());
        let key = cache_key(&settings(), true, SOURCE);
        let other = cache_key(&settings(), false, SOURCE);

        cache.store(&key, &graph()).await.unwrap();
        cache.store(&other, &graph()).await.unwrap();

        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.remove(&key).await.unwrap());
        assert_eq!(cache.lock_count().await, 0);
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.entry_path("../etc/passwd").is_err());
    }
}
