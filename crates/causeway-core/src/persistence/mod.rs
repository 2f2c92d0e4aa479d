//! Graph artifacts and the graph cache
//!
//! Three encodings of a [`CausalGraph`]:
//! - `.dag`: structured DAG text, loadable
//! - `.json`: flat assertion listing with provenance, write-only
//! - `.bin`: compact checksummed binary, used by the cache
//!
//! Every encoder walks nodes and edges in identifier order, so equal graphs
//! produce byte-identical artifacts.

pub mod binary;
pub mod cache;
pub mod dag;
pub mod json;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::domain::CausalGraph;
use crate::error::{Error, Result};
use crate::metrics::RunMetrics;

pub use binary::{BINARY_FORMAT_VERSION, BinaryCodec};
pub use cache::{GraphCache, cache_key, source_id};
pub use dag::DagTextCodec;
pub use json::{AssertionRecord, JsonAssertionEncoder};

/// Turns a graph into artifact bytes
pub trait GraphEncoder {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    fn encode(&self, graph: &CausalGraph) -> Result<Vec<u8>>;
}

/// Rebuilds a graph from artifact bytes
pub trait GraphDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<CausalGraph>;
}

/// Paths written by [`write_artifacts`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub dag: PathBuf,
    pub json: PathBuf,
    pub metrics: PathBuf,
}

/// Write `bytes` to `path` through a temporary sibling and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Load a graph artifact, choosing the decoder by extension
pub fn load_graph(path: &Path) -> Result<CausalGraph> {
    let bytes = std::fs::read(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("dag") => DagTextCodec.decode(&bytes),
        Some("bin") => BinaryCodec.decode(&bytes),
        _ => Err(Error::ArtifactFormat(format!(
            "{}: only .dag and .bin artifacts can be loaded",
            path.display()
        ))),
    }
}

/// Write the DAG text, JSON listing and metrics for one run
pub fn write_artifacts(
    graph: &CausalGraph,
    metrics: &RunMetrics,
    dir: &Path,
    stem: &str,
) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths {
        dag: dir.join(format!("{}.{}", stem, DagTextCodec.extension())),
        json: dir.join(format!("{}.{}", stem, JsonAssertionEncoder.extension())),
        metrics: dir.join(format!("{}.metrics.json", stem)),
    };

    write_atomic(&paths.dag, &DagTextCodec.encode(graph)?)?;
    write_atomic(&paths.json, &JsonAssertionEncoder.encode(graph)?)?;

    let mut metrics_bytes = serde_json::to_vec_pretty(metrics)?;
    metrics_bytes.push(b'\n');
    write_atomic(&paths.metrics, &metrics_bytes)?;

    info!(
        dag = %paths.dag.display(),
        json = %paths.json.display(),
        metrics = %paths.metrics.display(),
        "Artifacts written"
    );
    Ok(paths)
}
