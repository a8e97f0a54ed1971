//! Embedding provider trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! plus pure helpers for vector serialization, normalization of absent
//! vectors, and cosine distance.
//!
//! Concrete providers (OpenAI, Ollama, fastembed) live in the `grepctl`
//! app crate.
//!
//! # Absent vectors
//!
//! Storage layers may legally hand back either "no vector" or "a vector of
//! length zero" for an entry that has not been embedded. Both mean the same
//! thing. [`normalize`] folds the second into the first, and [`is_pending`]
//! is the single predicate every pending check goes through.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Trait for embedding providers.
///
/// `embed` returns one vector per input text, in input order. An empty
/// vector in the output marks a per-item failure; the corresponding entry
/// stays pending. A batch-level `Err` leaves the whole batch pending.
///
/// Implementations must be idempotent for identical input text, which is
/// what makes dedup by content hash sound.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Fold a zero-length vector into `None`.
pub fn normalize(vector: Option<Vec<f32>>) -> Option<Vec<f32>> {
    vector.filter(|v| !v.is_empty())
}

/// An entry needs a vector iff it has none or has an empty one.
pub fn is_pending(vector: Option<&[f32]>) -> bool {
    match vector {
        None => true,
        Some(v) => v.is_empty(),
    }
}

/// Normalize a provider vector and check it against the corpus dimensionality.
///
/// Returns `Ok(None)` for an absent/empty vector, `Ok(Some(v))` for a vector
/// of exactly `dims` finite values, and an error otherwise. Normalization runs
/// first so an empty vector is never reported as a dimension mismatch.
pub fn checked_vector(vector: Vec<f32>, dims: usize) -> Result<Option<Vec<f32>>> {
    let Some(v) = normalize(Some(vector)) else {
        return Ok(None);
    };
    if v.len() != dims {
        bail!(
            "embedding dimension mismatch: expected {}, got {}",
            dims,
            v.len()
        );
    }
    if v.iter().any(|x| !x.is_finite()) {
        bail!("embedding contains non-finite values");
    }
    Ok(Some(v))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use grepctl_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero-magnitude vectors.
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance `1 - cos(a, b)`, in `[0.0, 2.0]`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}
