//! Dense vector embeddings for semantic search.
//!
//! Vectors are stored as little-endian f32 blobs; similarity is cosine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One dense vector per extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    /// Database row ID.
    pub id: i64,
    /// Owning extraction; at most one embedding per extraction.
    pub extraction_id: i64,
    /// The vector itself.
    pub vector: Vec<f32>,
    /// Embedding model that produced the vector.
    pub model_name: String,
    /// Must equal `vector.len()` and the model's expected dimensions.
    pub dimensions: usize,
    /// Length of the text that was embedded.
    pub text_length: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 blob back into a vector.
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors. Returns 0.0 on length mismatch or
/// zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
