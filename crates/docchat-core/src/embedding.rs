//! Embedding collaborator and the vector math shared by both stores.
//!
//! Providers live in the app crate (OpenAI, Ollama); tests inject fakes.
//! Vectors are persisted as packed little-endian `f32` bytes.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Turns text into fixed-width vectors.
///
/// A provider may fail or rate-limit; the indexer owns retry policy.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Width of every vector this provider returns.
    fn dims(&self) -> usize;
    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed one query string through a batch API.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let vectors = provider.embed(&[text.to_string()]).await?;
    match <[Vec<f32>; 1]>::try_from(vectors) {
        Ok([vector]) => Ok(vector),
        Err(vectors) => bail!("expected one query vector, provider returned {}", vectors.len()),
    }
}

pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes short of a full `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine of the angle between `a` and `b`.
///
/// Mismatched widths, empty inputs and zero vectors score `0.0`, never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let norm = (aa * bb).sqrt();
    if norm <= f32::EPSILON {
        0.0
    } else {
        dot / norm
    }
}
