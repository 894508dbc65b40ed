use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Chunk;

pub mod lance_store;
pub mod memory;

pub use lance_store::LanceVectorStore;
pub use memory::InMemoryVectorStore;

/// A chunk together with the vector it is indexed under.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }
}

/// Nearest-neighbour hit. `score` is cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Vector storage capability. Namespaces isolate documents from each other;
/// the pipeline uses the document id as the namespace.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records by chunk id.
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()>;

    /// Up to `top_k` nearest chunks, best first. Ties are ordered by chunk id.
    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>>;

    /// Content hash of every stored chunk, keyed by chunk id.
    async fn fetch_hashes(&self, namespace: &str) -> Result<HashMap<String, String>>;

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()>;

    async fn count(&self, namespace: &str) -> Result<usize>;
}

/// Best-first ordering shared by store implementations.
pub(crate) fn sort_hits(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}
