//! Document ingestion: chunk, embed and upsert into the document's namespace.
//!
//! Re-ingesting the same document is idempotent. Chunks whose content hash is
//! already stored are not re-embedded, and chunks that no longer exist are
//! removed.

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result, Service};
use crate::processing::TextChunker;
use crate::storage::VectorRecord;
use crate::types::{Chunk, Document};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub document_id: String,
    pub pages: usize,
    pub total_chunks: usize,
    /// Chunks embedded and written during this run.
    pub indexed: usize,
    /// Chunks already stored with identical content.
    pub unchanged: usize,
    /// Stale chunks deleted from the namespace.
    pub removed: usize,
    pub elapsed_ms: u64,
}

pub struct Indexer {
    ctx: PipelineContext,
    chunker: TextChunker,
}

impl Indexer {
    pub fn new(ctx: PipelineContext) -> Self {
        let chunker = TextChunker::from_config(&ctx.config.chunking);
        Self { ctx, chunker }
    }

    pub fn chunker(&self) -> &TextChunker {
        &self.chunker
    }

    pub async fn ingest(&self, document: &Document) -> Result<IndexReport> {
        let start = Instant::now();
        let namespace = document.id.as_str();
        let chunks = self.chunker.chunk_document(document);

        let stored = self.ctx.store_hashes(namespace).await?;
        let current_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();

        let (unchanged, changed): (Vec<Chunk>, Vec<Chunk>) = chunks
            .iter()
            .cloned()
            .partition(|c| stored.get(&c.id) == Some(&c.content_hash));

        let stale: Vec<String> = stored
            .keys()
            .filter(|id| !current_ids.contains(id.as_str()))
            .cloned()
            .collect();

        let batch_size = self.ctx.config.runtime.embed_batch_size.max(1);
        let mut indexed = 0;
        for (batch_index, batch) in changed.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.ctx.embed_documents(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::external(
                    Service::Embedding,
                    format!("expected {} embeddings, received {}", batch.len(), vectors.len()),
                    false,
                ));
            }

            let records: Vec<VectorRecord> = batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRecord { chunk, vector })
                .collect();
            self.ctx.store_upsert(namespace, records).await?;
            indexed += batch.len();

            tracing::debug!(
                doc_id = %namespace,
                batch = batch_index + 1,
                size = batch.len(),
                "Upserted embedding batch"
            );
        }

        if !stale.is_empty() {
            self.ctx.store_delete(namespace, &stale).await?;
        }

        let report = IndexReport {
            document_id: document.id.clone(),
            pages: document.page_count(),
            total_chunks: chunks.len(),
            indexed,
            unchanged: unchanged.len(),
            removed: stale.len(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        tracing::info!(
            doc_id = %report.document_id,
            source = %document.source,
            chunks = report.total_chunks,
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            elapsed_ms = report.elapsed_ms,
            "Indexed document"
        );
        Ok(report)
    }
}
