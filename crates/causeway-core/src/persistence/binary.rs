//! Compact binary graph format
//!
//! Layout:
//! - magic `CWG1` (4 bytes)
//! - format version (u16, little endian)
//! - payload length (u64, little endian)
//! - bincode-encoded [`GraphArchive`]
//! - SHA-256 of everything above (32 bytes)

use sha2::{Digest, Sha256};

use super::{GraphDecoder, GraphEncoder};
use crate::domain::{CausalGraph, GraphArchive};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"CWG1";
pub const BINARY_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 8;
const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl GraphEncoder for BinaryCodec {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn encode(&self, graph: &CausalGraph) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&graph.to_archive())?;

        let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&BINARY_FORMAT_VERSION.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(&payload);

        let checksum = Sha256::digest(&data);
        data.extend_from_slice(&checksum);
        Ok(data)
    }
}

impl GraphDecoder for BinaryCodec {
    fn decode(&self, bytes: &[u8]) -> Result<CausalGraph> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(Error::ArtifactFormat("binary artifact is truncated".to_string()));
        }
        if &bytes[..4] != MAGIC {
            return Err(Error::ArtifactFormat("invalid binary magic number".to_string()));
        }

        let (body, stored) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != stored {
            return Err(Error::ArtifactFormat("binary checksum mismatch".to_string()));
        }

        let mut version = [0u8; 2];
        version.copy_from_slice(&body[4..6]);
        let version = u16::from_le_bytes(version);
        if version != BINARY_FORMAT_VERSION {
            return Err(Error::ArtifactFormat(format!(
                "unsupported binary format version {}",
                version
            )));
        }

        let mut len = [0u8; 8];
        len.copy_from_slice(&body[6..HEADER_LEN]);
        let payload = &body[HEADER_LEN..];
        if u64::from_le_bytes(len) != payload.len() as u64 {
            return Err(Error::ArtifactFormat("binary payload length mismatch".to_string()));
        }

        let archive: GraphArchive = bincode::deserialize(payload)?;
        CausalGraph::from_archive(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Assertion, CAUSES, Concept, ConceptId, ConceptRole};

    fn graph() -> CausalGraph {
        let a = ConceptId::parse("C0020538").unwrap();
        let b = ConceptId::parse("C0021368").unwrap();
        let mut graph = CausalGraph::new();
        graph.insert_node(Concept::seed(a.clone(), ConceptRole::Exposure));
        graph.insert_node(Concept::discovered(b.clone(), "Inflammation", 1));
        graph
            .put_edge(Assertion::new(a, b, CAUSES, 7, 1).with_citations(["31234567"]))
            .unwrap();
        graph
    }

    #[test]
    fn test_binary_preserves_everything() {
        let original = graph();
        let bytes = BinaryCodec.encode(&original).unwrap();
        assert_eq!(&bytes[..4], b"CWG1");
        assert_eq!(BinaryCodec.decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut bytes = BinaryCodec.encode(&graph()).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        let err = BinaryCodec.decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_truncation_and_magic() {
        let bytes = BinaryCodec.encode(&graph()).unwrap();
        assert!(BinaryCodec.decode(&bytes[..10]).is_err());

        let mut wrong = bytes.clone();
        wrong[0] = b'X';
        assert!(BinaryCodec.decode(&wrong).unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(
            BinaryCodec.encode(&graph()).unwrap(),
            BinaryCodec.encode(&graph()).unwrap()
        );
    }
}
