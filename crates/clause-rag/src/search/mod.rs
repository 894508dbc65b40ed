pub mod hybrid;
pub mod keyword;

pub use hybrid::{min_max_normalize, weighted_fusion, Candidate};
pub use keyword::{tokenize, Bm25Scorer};

use crate::context::PipelineContext;
use crate::error::Result;
use crate::types::RetrievedChunk;

/// Vector recall followed by keyword re-scoring over the same candidate pool.
pub struct HybridRetriever {
    ctx: PipelineContext,
    scorer: Bm25Scorer,
}

impl HybridRetriever {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            scorer: Bm25Scorer::new(),
        }
    }

    /// Retrieve up to `hybrid_top_n` chunks of `namespace` for `question`.
    ///
    /// An empty namespace yields an empty list rather than an error.
    pub async fn retrieve(&self, namespace: &str, question: &str) -> Result<Vec<RetrievedChunk>> {
        let retrieval = &self.ctx.config.retrieval;
        let query_vector = self.ctx.embed_query(question).await?;
        let hits = self
            .ctx
            .store_query(namespace, &query_vector, retrieval.vector_candidates)
            .await?;

        if hits.is_empty() {
            tracing::debug!(namespace, "No vector candidates");
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = hits.iter().map(|h| h.chunk.text.as_str()).collect();
        let keyword_scores = match self.scorer.score_pool(question, &texts) {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(namespace, error = %format!("{:#}", e), "Keyword scoring failed, using vector scores only");
                vec![0.0; texts.len()]
            }
        };

        let pool_size = hits.len();
        let candidates: Vec<Candidate> = hits
            .into_iter()
            .zip(keyword_scores)
            .filter(|(hit, kw)| hit.score >= retrieval.min_vector_score || *kw > 0.0)
            .map(|(hit, kw)| Candidate {
                chunk: hit.chunk,
                vector_score: hit.score,
                keyword_score: kw,
            })
            .collect();

        let fused = weighted_fusion(candidates, retrieval.alpha, retrieval.hybrid_top_n);
        tracing::debug!(
            namespace,
            pool = pool_size,
            kept = fused.len(),
            top_score = fused.first().map(|r| r.hybrid_score).unwrap_or(0.0),
            "Hybrid retrieval complete"
        );
        Ok(fused)
    }
}
