use std::cmp::Ordering;

use crate::types::{Chunk, RetrievedChunk};

/// A vector-store candidate with its raw scores, before fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub vector_score: f32,
    pub keyword_score: f32,
}

/// Min-max normalize into [0, 1].
///
/// When every score is identical there is no spread to normalize; the shared
/// value maps to 1.0 if it is positive and 0.0 otherwise, so a lone relevant
/// candidate is not zeroed out.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    let range = max - min;
    if range.abs() < 1e-9 {
        let uniform = if max > 0.0 { 1.0 } else { 0.0 };
        return vec![uniform; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

/// `alpha * vector + (1 - alpha) * keyword` over already-normalized scores.
pub fn fuse(vector_norm: f32, keyword_norm: f32, alpha: f32) -> f32 {
    alpha * vector_norm + (1.0 - alpha) * keyword_norm
}

/// Hybrid ordering: fused score descending, ties broken by chunk id.
pub fn compare_retrieved(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    b.hybrid_score
        .total_cmp(&a.hybrid_score)
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

/// Weighted fusion over one candidate pool. Deterministic for fixed inputs.
pub fn weighted_fusion(candidates: Vec<Candidate>, alpha: f32, top_n: usize) -> Vec<RetrievedChunk> {
    let vector_raw: Vec<f32> = candidates.iter().map(|c| c.vector_score).collect();
    let keyword_raw: Vec<f32> = candidates.iter().map(|c| c.keyword_score).collect();
    let vector_norm = min_max_normalize(&vector_raw);
    let keyword_norm = min_max_normalize(&keyword_raw);

    let mut merged: Vec<RetrievedChunk> = candidates
        .into_iter()
        .zip(vector_norm.into_iter().zip(keyword_norm))
        .map(|(c, (v, k))| RetrievedChunk {
            hybrid_score: fuse(v, k, alpha),
            chunk: c.chunk,
            vector_score: c.vector_score,
            keyword_score: c.keyword_score,
        })
        .collect();

    merged.sort_by(compare_retrieved);
    merged.truncate(top_n);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, vector_score: f32, keyword_score: f32) -> Candidate {
        Candidate {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "doc".into(),
                page: 1,
                index: 0,
                text: String::new(),
                heading: None,
                start_offset: 0,
                end_offset: 0,
                content_hash: String::new(),
                embedding: Vec::new(),
            },
            vector_score,
            keyword_score,
        }
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(min_max_normalize(&[0.2, 0.6, 1.0]), vec![0.0, 0.5, 1.0]);
        assert_eq!(min_max_normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn test_alpha_weights_vector_over_keyword() {
        let fused = weighted_fusion(
            vec![candidate("a", 0.9, 0.0), candidate("b", 0.1, 5.0)],
            0.7,
            10,
        );
        assert_eq!(fused[0].chunk.id, "a");
        assert!((fused[0].hybrid_score - 0.7).abs() < 1e-6);
        assert!((fused[1].hybrid_score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_chunk_id() {
        let fused = weighted_fusion(
            vec![candidate("c", 0.5, 1.0), candidate("a", 0.5, 1.0), candidate("b", 0.5, 1.0)],
            0.7,
            10,
        );
        let ids: Vec<&str> = fused.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fusion_is_reproducible_and_truncated() {
        let pool = || {
            vec![
                candidate("x", 0.3, 2.0),
                candidate("y", 0.8, 0.5),
                candidate("z", 0.6, 1.5),
                candidate("w", 0.1, 0.0),
            ]
        };
        let first = weighted_fusion(pool(), 0.7, 3);
        let second = weighted_fusion(pool(), 0.7, 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].hybrid_score >= w[1].hybrid_score));
    }
}
