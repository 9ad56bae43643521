//! JSON records exchanged with the nodes' data and query endpoints.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// One document as stored on one node: that node's share of every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document id, identical across nodes.
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// This node's share of every embedding element.
    pub embedding: Vec<i64>,
    /// This node's chunk share, base64 encoded.
    pub chunk: String,
    /// Cluster label assigned at write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_centroid: Option<u32>,
}

/// Projection of a document read back for chunk reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChunkRecord {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// Chunk share, base64 encoded.
    pub chunk: String,
}

impl ChunkRecord {
    /// Decodes the base64 chunk share.
    pub fn share_bytes(&self) -> Result<Vec<u8>> {
        decode_chunk(&self.chunk)
    }
}

/// Output row of the subtract query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferenceRecord {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// Element-wise `stored - query` over shares.
    pub difference: Vec<i64>,
}

/// One cluster centroid, replicated in plaintext fixed point on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentroidRecord {
    /// Record id.
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// Cluster label documents were tagged with.
    pub label: u32,
    /// Fixed-point centroid coordinates.
    pub cluster_centroid: Vec<i64>,
}

/// Base64 form used for chunk shares on the wire.
pub fn encode_chunk(share: &[u8]) -> String {
    B64.encode(share)
}

/// Inverse of [`encode_chunk`].
pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>> {
    B64.decode(encoded.as_bytes())
        .map_err(|err| RagError::Reconstruction(format!("chunk share is not base64: {err}")))
}
