//! Vector retrieval abstraction over two interchangeable backends.
//!
//! [`VectorStore`] is the capability set the RAG services program against:
//! collection lifecycle, point upsert/delete/count/scroll/search. Concrete
//! implementations:
//!
//! - [`QdrantStore`]: persistent server-side cosine ANN (the primary backend).
//! - [`CacheVectorStore`]: documents and embeddings as cache keys with
//!   brute-force cosine search; useful without a vector DB deployment.

mod cache;
mod qdrant;

pub use cache::CacheVectorStore;
pub use qdrant::QdrantStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("vector store not connected")]
    NotConnected,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("payload encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(#[from] crate::queue::QueueError),
}

/// A search hit: point id, cosine score, stored payload.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// A stored point as returned by scroll (no vector, no score).
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub payload: serde_json::Value,
}

/// Capability set shared by both backends.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Creates the collection when missing; idempotent. The vector dimension
    /// is fixed to `dim` (the first vector length seen by callers).
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), VectorStoreError>;

    async fn upsert(
        &self,
        name: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), VectorStoreError>;

    /// Returns false when the point (or the whole backend) was absent.
    async fn delete(&self, name: &str, id: &str) -> Result<bool, VectorStoreError>;

    async fn count(&self, name: &str) -> Result<u64, VectorStoreError>;

    async fn scroll(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<(Vec<VectorRecord>, Option<String>), VectorStoreError>;

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, VectorStoreError>;

    async fn exists(&self, name: &str, id: &str) -> Result<bool, VectorStoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError>;
}

/// Cosine similarity on equal-length vectors; 0.0 when the lengths differ
/// or either magnitude is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_is_one_for_identical_unit_vectors() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_is_symmetric_and_bounded() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-3.0, 0.5, 2.0];
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        assert!((ab - ba).abs() < 1e-6);
        assert!((-1.0..=1.0).contains(&ab));
    }

    #[test]
    fn cosine_is_zero_for_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn cosine_is_zero_for_zero_magnitude() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }
}
