//! Text embedding backends.

mod hashing;
mod openai;

pub use hashing::HashingEmbedder;
pub use openai::OpenAiEmbedder;

use crate::error::{RagError, Result};

/// Turns text into a dense vector. Implementations are blocking; async callers run them
/// on the blocking pool.
pub trait Embedder: Send + Sync {
    /// Dimensionality of every vector this embedder returns, when known up front.
    fn dimensions(&self) -> Option<usize>;

    /// Embeds a batch, preserving input order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single string.
    fn embed(&self, input: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[input])?
            .pop()
            .ok_or_else(|| RagError::Embedding("embedder returned no vector".into()))
    }
}
