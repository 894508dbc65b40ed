//! Shared pipeline context.
//!
//! Bundles configuration with the three external capabilities and wraps every
//! outbound call in the retry/timeout policy, so stages never talk to a
//! capability directly.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::llm::{with_retry, Generation, Generator, RetryPolicy};
use crate::storage::{ScoredChunk, VectorRecord, VectorStore};

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let retry = RetryPolicy::from_runtime(&config.runtime);
        Self {
            config: Arc::new(config),
            embedder,
            generator,
            store,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ── Resilient capability calls ─────────────────────────────────────────

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        with_retry(&self.retry, "embed_query", || self.embedder.embed(text)).await
    }

    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_retry(&self.retry, "embed_documents", || self.embedder.embed_batch(texts)).await
    }

    pub async fn generate(&self, operation: &str, prompt: &str, schema: Option<&JsonValue>) -> Result<Generation> {
        with_retry(&self.retry, operation, || self.generator.generate(prompt, schema)).await
    }

    pub async fn store_query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>> {
        with_retry(&self.retry, "vector_query", || self.store.query(namespace, vector, top_k)).await
    }

    pub async fn store_upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        with_retry(&self.retry, "vector_upsert", || self.store.upsert(namespace, records.clone())).await
    }

    pub async fn store_hashes(&self, namespace: &str) -> Result<HashMap<String, String>> {
        with_retry(&self.retry, "vector_fetch_hashes", || self.store.fetch_hashes(namespace)).await
    }

    pub async fn store_delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        with_retry(&self.retry, "vector_delete", || self.store.delete(namespace, ids)).await
    }

    pub fn generation_model(&self) -> &str {
        self.generator.model_id()
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_id()
    }
}
