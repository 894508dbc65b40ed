use async_trait::async_trait;

use super::Embedder;
use crate::error::{PipelineError, Result};
use crate::search::keyword::tokenize;

/// Feature-hashing embedder. Deterministic and offline, so ingestion and
/// retrieval work without an embedding service.
///
/// Unigrams and bigrams are hashed into a fixed number of signed buckets and
/// the result is L2-normalized, which makes cosine similarity a bag-of-words
/// overlap measure.
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(PipelineError::Config(
                "hashing embedder dimension must be > 0".into(),
            ));
        }
        Ok(Self {
            dimension,
            model_id: format!("feature-hashing-{}", dimension),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dimension];

        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, &bigram, 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) % self.dimension as u64;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket as usize] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[test]
    fn test_vectors_are_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(256).unwrap();
        let a = embedder.embed_text("Maternity expenses are covered after 24 months");
        let b = embedder.embed_text("Maternity expenses are covered after 24 months");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_text_is_closer() {
        let embedder = HashingEmbedder::new(512).unwrap();
        let query = embedder.embed_text("maternity expenses cover");
        let related = embedder.embed_text("The policy covers maternity expenses after waiting period");
        let unrelated = embedder.embed_text("Dental implants require prior authorisation");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let texts = vec!["first passage".to_string(), "second passage".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], embedder.embed(&texts[1]).await.unwrap());
    }

    #[test]
    fn test_stopword_only_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(32).unwrap();
        assert!(embedder.embed_text("the of and").iter().all(|v| *v == 0.0));
    }
}
