pub mod remote;

use crate::error::Result;
use async_trait::async_trait;

pub use remote::RemoteEmbeddings;

/// Text to fixed-dimension unit vectors. Batch calls preserve input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. `task` distinguishes query vs passage prefixes
    /// for models that care ("search_query" / "search_document").
    async fn embed(&self, text: &str, task: &str) -> Result<Vec<f32>>;

    /// Embed a batch, one vector per input, same order.
    async fn embed_batch(&self, texts: &[String], task: &str) -> Result<Vec<Vec<f32>>>;

    /// Output dimension; fixed for the life of the index.
    fn dimension(&self) -> usize;
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
