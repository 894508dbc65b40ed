use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{sort_hits, ScoredChunk, VectorRecord, VectorStore};
use crate::embeddings::cosine_similarity;
use crate::error::Result;

/// Exact-search store held in process memory.
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        let entries = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            entries.insert(record.chunk.id.clone(), record);
        }
        Ok(())
    }

    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>> {
        let namespaces = self.namespaces.read();
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<ScoredChunk> = entries
            .values()
            .map(|r| ScoredChunk {
                chunk: r.chunk.clone(),
                score: cosine_similarity(vector, &r.vector),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch_hashes(&self, namespace: &str) -> Result<HashMap<String, String>> {
        let namespaces = self.namespaces.read();
        Ok(namespaces
            .get(namespace)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, r)| (id.clone(), r.chunk.content_hash.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if let Some(entries) = namespaces.get_mut(namespace) {
            for id in ids {
                entries.remove(id);
            }
        }
        Ok(())
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(BTreeMap::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "doc".into(),
                page: 1,
                index: 0,
                text: format!("text of {}", id),
                heading: None,
                start_offset: 0,
                end_offset: 0,
                content_hash: format!("hash-{}", id),
                embedding: Vec::new(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity_then_id() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "doc",
                vec![
                    record("b", vec![1.0, 0.0]),
                    record("a", vec![1.0, 0.0]),
                    record("c", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.query("doc", &[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = InMemoryVectorStore::new();
        store.upsert("one", vec![record("x", vec![1.0])]).await.unwrap();
        assert!(store.query("two", &[1.0], 5).await.unwrap().is_empty());
        assert_eq!(store.count("one").await.unwrap(), 1);
        assert_eq!(store.count("two").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let store = InMemoryVectorStore::new();
        store.upsert("doc", vec![record("x", vec![1.0])]).await.unwrap();
        store.upsert("doc", vec![record("x", vec![0.5])]).await.unwrap();
        assert_eq!(store.count("doc").await.unwrap(), 1);

        let hashes = store.fetch_hashes("doc").await.unwrap();
        assert_eq!(hashes.get("x").map(String::as_str), Some("hash-x"));

        store.delete("doc", &["x".to_string()]).await.unwrap();
        assert_eq!(store.count("doc").await.unwrap(), 0);
    }
}
