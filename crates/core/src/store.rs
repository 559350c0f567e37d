use crate::models::ChunkRecord;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkRecord,
}

impl VectorRecord {
    /// Stable numeric point id derived from the textual record id.
    pub fn numeric_id(&self) -> u64 {
        point_id(&self.id)
    }
}

/// First eight bytes of the SHA-256 of `id`, big-endian.
pub fn point_id(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub text: String,
    pub metadata: ChunkRecord,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub text: String,
    pub metadata: ChunkRecord,
}
