//! LLM-based batch reranker for hybrid retrieval candidates.
//!
//! The whole candidate pool goes out in a single call that asks for a
//! relevance score in [0, 1] per passage. The result is re-sorted and cut to
//! `top_k`.
//!
//! Falls back to hybrid order when the LLM is unavailable or produces
//! unparseable output. That path is flagged as degraded and never errors.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::context::PipelineContext;
use crate::types::{clamp_unit, DegradedReason, RankedChunk, RetrievedChunk, TokenUsage};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOutcome {
    pub ranked: Vec<RankedChunk>,
    pub degraded: Option<DegradedReason>,
    pub usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct ScoreList {
    scores: Vec<PassageScore>,
}

#[derive(Debug, Deserialize)]
struct PassageScore {
    passage: usize,
    score: f64,
}

fn rerank_schema() -> JsonValue {
    json!({
        "type": "OBJECT",
        "properties": {
            "scores": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "passage": { "type": "INTEGER" },
                        "score": { "type": "NUMBER" }
                    },
                    "required": ["passage", "score"]
                }
            }
        },
        "required": ["scores"]
    })
}

pub struct LlmReranker {
    ctx: PipelineContext,
}

impl LlmReranker {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn rerank(&self, question: &str, candidates: Vec<RetrievedChunk>) -> RerankOutcome {
        let config = &self.ctx.config.rerank;
        if candidates.is_empty() {
            return RerankOutcome::default();
        }
        if !config.enabled {
            return RerankOutcome {
                ranked: hybrid_order(candidates, config.top_k),
                ..Default::default()
            };
        }

        let prompt = build_prompt(question, &candidates, config.snippet_chars);
        let schema = rerank_schema();
        let generation = match self.ctx.generate("rerank", &prompt, Some(&schema)).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(error = %e, kind = e.kind(), "Reranking call failed, keeping hybrid order");
                return RerankOutcome {
                    ranked: hybrid_order(candidates, config.top_k),
                    degraded: Some(DegradedReason::RerankUnavailable),
                    usage: TokenUsage::default(),
                };
            }
        };

        match parse_scores(&generation.text, candidates.len()) {
            Some(scores) => {
                let ranked = apply_scores(candidates, &scores, config.top_k);
                tracing::debug!(
                    kept = ranked.len(),
                    top = ranked.first().map(|r| r.rerank_score).unwrap_or(0.0),
                    "Reranking parsed successfully"
                );
                RerankOutcome {
                    ranked,
                    degraded: None,
                    usage: generation.usage,
                }
            }
            None => {
                tracing::warn!(
                    output = %generation.text.chars().take(200).collect::<String>(),
                    "Could not parse reranking output, keeping hybrid order"
                );
                RerankOutcome {
                    ranked: hybrid_order(candidates, config.top_k),
                    degraded: Some(DegradedReason::RerankParseFailure),
                    usage: generation.usage,
                }
            }
        }
    }
}

fn build_prompt(question: &str, candidates: &[RetrievedChunk], snippet_chars: usize) -> String {
    let passages: String = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let truncated: String = c.chunk.text.chars().take(snippet_chars).collect();
            format!("[{}] (page {}) {}", i + 1, c.chunk.page, truncated)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a relevance judge for insurance, legal and HR documents. Given a question and \
         numbered passages from one document, rate how useful each passage is for answering the \
         question.\n\n\
         Question: \"{}\"\n\n\
         Passages:\n{}\n\n\
         Return JSON of the form {{\"scores\": [{{\"passage\": 1, \"score\": 0.8}}, ...]}} with one \
         entry for each of the {} passages. Scores are between 0.0 (irrelevant) and 1.0 (directly \
         answers the question).",
        question,
        passages,
        candidates.len()
    )
}

/// Parse the LLM output into one score per passage.
///
/// Three-tier strategy:
/// 1. Direct JSON parse of the full output
/// 2. Find the outermost `{...}` substring and parse that
/// 3. Accept a bare `[...]` array of numbers, one per passage
///
/// Passages the model skipped score 0.0. Out-of-range passage numbers or
/// non-finite scores reject the whole output.
fn parse_scores(output: &str, expected_count: usize) -> Option<Vec<f32>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    // Strategy 1: direct JSON parse
    if let Ok(list) = serde_json::from_str::<ScoreList>(trimmed) {
        return scores_from_list(list, expected_count);
    }

    // Strategy 2: first `{` to last `}`
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(list) = serde_json::from_str::<ScoreList>(&trimmed[start..=end]) {
                return scores_from_list(list, expected_count);
            }
        }
    }

    // Strategy 3: plain array of scores in passage order
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(values) = serde_json::from_str::<Vec<f64>>(&trimmed[start..=end]) {
                if values.len() == expected_count && values.iter().all(|v| v.is_finite()) {
                    return Some(values.into_iter().map(|v| clamp_unit(v as f32)).collect());
                }
            }
        }
    }

    None
}

fn scores_from_list(list: ScoreList, expected_count: usize) -> Option<Vec<f32>> {
    if list.scores.is_empty() {
        return None;
    }
    let mut by_passage: HashMap<usize, f32> = HashMap::new();
    for entry in list.scores {
        if entry.passage == 0 || entry.passage > expected_count || !entry.score.is_finite() {
            return None;
        }
        by_passage
            .entry(entry.passage)
            .or_insert_with(|| clamp_unit(entry.score as f32));
    }
    Some(
        (1..=expected_count)
            .map(|p| by_passage.get(&p).copied().unwrap_or(0.0))
            .collect(),
    )
}

/// Rerank score descending, then hybrid score, then chunk index.
pub fn compare_ranked(a: &RankedChunk, b: &RankedChunk) -> Ordering {
    b.rerank_score
        .total_cmp(&a.rerank_score)
        .then_with(|| b.hybrid_score().total_cmp(&a.hybrid_score()))
        .then_with(|| a.chunk().index.cmp(&b.chunk().index))
}

fn apply_scores(candidates: Vec<RetrievedChunk>, scores: &[f32], top_k: usize) -> Vec<RankedChunk> {
    let mut ranked: Vec<RankedChunk> = candidates
        .into_iter()
        .zip(scores.iter().copied())
        .map(|(retrieved, rerank_score)| RankedChunk {
            retrieved,
            rerank_score,
        })
        .collect();
    ranked.sort_by(compare_ranked);
    ranked.truncate(top_k);
    ranked
}

/// Fallback ranking: the hybrid score stands in for the rerank score.
pub fn hybrid_order(candidates: Vec<RetrievedChunk>, top_k: usize) -> Vec<RankedChunk> {
    let scores: Vec<f32> = candidates.iter().map(|c| clamp_unit(c.hybrid_score)).collect();
    apply_scores(candidates, &scores, top_k)
}
