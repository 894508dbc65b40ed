use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray, UInt32Array, UInt64Array,
};
use anyhow::Context;
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::{sort_hits, ScoredChunk, VectorRecord, VectorStore};
use crate::error::{PipelineError, Result, Service};
use crate::types::Chunk;

const TABLE_NAME: &str = "chunks";
const SEED_ID: &str = "__seed__";

fn store_err(context: &'static str) -> impl Fn(lancedb::Error) -> PipelineError {
    move |e| PipelineError::external(Service::VectorStore, format!("{}: {}", context, e), false)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Persistent store backed by LanceDB. All documents share one table and are
/// separated by the `doc_id` column.
pub struct LanceVectorStore {
    db: lancedb::Connection,
}

impl LanceVectorStore {
    pub async fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            PipelineError::external(
                Service::VectorStore,
                format!("Failed to create {}: {}", path.display(), e),
                false,
            )
        })?;
        let uri = path.to_string_lossy();
        let db = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(store_err("Failed to connect to LanceDB"))?;
        tracing::info!(path = %path.display(), "Opened LanceDB vector store");
        Ok(Self { db })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("page", DataType::UInt32, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("heading", DataType::Utf8, true),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("start_offset", DataType::UInt64, false),
            Field::new("end_offset", DataType::UInt64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                true,
            ),
            Field::new("ingested_at", DataType::Int64, false),
        ]))
    }

    fn to_batch(records: &[VectorRecord], dimension: usize) -> anyhow::Result<RecordBatch> {
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dimension) {
            anyhow::bail!(
                "chunk {} has a {}-dimensional vector, expected {}",
                bad.chunk.id,
                bad.vector.len(),
                dimension
            );
        }

        let ingested_at = chrono::Utc::now().timestamp_millis();
        let flat: Vec<f32> = records.iter().flat_map(|r| r.vector.iter().copied()).collect();
        let vector_array = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            dimension as i32,
            Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
            None,
        )
        .context("Failed to build vector column")?;

        RecordBatch::try_new(
            Self::schema(dimension),
            vec![
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.chunk.id.as_str())))
                    as Arc<dyn Array>,
                Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.chunk.document_id.as_str()),
                )),
                Arc::new(UInt32Array::from_iter_values(records.iter().map(|r| r.chunk.page))),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|r| r.chunk.index as u32),
                )),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.chunk.text.as_str()))),
                Arc::new(StringArray::from(
                    records
                        .iter()
                        .map(|r| r.chunk.heading.as_deref())
                        .collect::<Vec<Option<&str>>>(),
                )),
                Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.chunk.content_hash.as_str()),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|r| r.chunk.start_offset as u64),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|r| r.chunk.end_offset as u64),
                )),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![ingested_at; records.len()])),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    fn batch_for(records: &[VectorRecord], dimension: usize) -> Result<RecordBatch> {
        Self::to_batch(records, dimension).map_err(|e| PipelineError::Validation(format!("{:#}", e)))
    }

    async fn table(&self) -> Result<Option<lancedb::Table>> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(store_err("Failed to list tables"))?;
        if !names.iter().any(|n| n == TABLE_NAME) {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(store_err("Failed to open chunks table"))?;
        Ok(Some(table))
    }

    /// The vector width is only known once the first embeddings arrive, so
    /// the table is created on first write.
    async fn ensure_table(&self, dimension: usize) -> Result<lancedb::Table> {
        if let Some(table) = self.table().await? {
            return Ok(table);
        }

        // Create with a single seed record, then delete it
        let seed = VectorRecord {
            chunk: Chunk {
                id: SEED_ID.to_string(),
                document_id: SEED_ID.to_string(),
                page: 0,
                index: 0,
                text: String::new(),
                heading: None,
                start_offset: 0,
                end_offset: 0,
                content_hash: String::new(),
                embedding: Vec::new(),
            },
            vector: vec![0.0; dimension],
        };
        let batch = Self::batch_for(std::slice::from_ref(&seed), dimension)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], Self::schema(dimension));
        self.db
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .map_err(store_err("Failed to create chunks table"))?;

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(store_err("Failed to open chunks table"))?;
        table
            .delete(&format!("id = {}", quote(SEED_ID)))
            .await
            .map_err(store_err("Failed to remove seed record"))?;
        tracing::info!(dimension, "Created chunks table");
        Ok(table)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let dimension = records[0].vector.len();
        let batch = Self::batch_for(&records, dimension)?;
        let table = self.ensure_table(dimension).await?;

        let ids: Vec<String> = records.iter().map(|r| r.chunk.id.clone()).collect();
        self.delete(namespace, &ids).await?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], Self::schema(dimension));
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(store_err("Failed to insert chunks"))?;

        tracing::debug!(namespace, count = records.len(), "Upserted chunks into LanceDB");
        Ok(())
    }

    async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>> {
        let Some(table) = self.table().await? else {
            return Ok(Vec::new());
        };

        let results = table
            .query()
            .nearest_to(vector)
            .map_err(store_err("Invalid query vector"))?
            .distance_type(lancedb::DistanceType::Cosine)
            .only_if(format!("doc_id = {}", quote(namespace)))
            .limit(top_k)
            .execute()
            .await
            .map_err(store_err("LanceDB vector search failed"))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(store_err("Failed to read search results"))?;
        let mut hits = extract_hits_from_batches(&batches);
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch_hashes(&self, namespace: &str) -> Result<HashMap<String, String>> {
        let Some(table) = self.table().await? else {
            return Ok(HashMap::new());
        };

        let results = table
            .query()
            .only_if(format!("doc_id = {}", quote(namespace)))
            .select(lancedb::query::Select::columns(&["id", "content_hash"]))
            .execute()
            .await
            .map_err(store_err("Failed to query content hashes"))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(store_err("Failed to read content hashes"))?;

        let mut hashes = HashMap::new();
        for batch in &batches {
            let ids = string_column(batch, "id");
            let content = string_column(batch, "content_hash");
            if let (Some(ids), Some(content)) = (ids, content) {
                for i in 0..batch.num_rows() {
                    hashes.insert(ids.value(i).to_string(), content.value(i).to_string());
                }
            }
        }
        Ok(hashes)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let Some(table) = self.table().await? else {
            return Ok(());
        };

        // Batch to avoid overly long SQL predicates
        for group in ids.chunks(50) {
            let id_list: Vec<String> = group.iter().map(|id| quote(id)).collect();
            let predicate = format!(
                "doc_id = {} AND id IN ({})",
                quote(namespace),
                id_list.join(", ")
            );
            table
                .delete(&predicate)
                .await
                .map_err(store_err("Failed to delete chunks"))?;
        }
        Ok(())
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let Some(table) = self.table().await? else {
            return Ok(0);
        };
        table
            .count_rows(Some(format!("doc_id = {}", quote(namespace))))
            .await
            .map_err(store_err("Failed to count chunks"))
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}

fn u32_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
}

fn u64_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
}

/// Rebuild chunks from search result batches. Score is `1 - cosine distance`.
fn extract_hits_from_batches(batches: &[RecordBatch]) -> Vec<ScoredChunk> {
    let mut hits = Vec::new();
    for batch in batches {
        let (Some(ids), Some(doc_ids), Some(texts), Some(hashes)) = (
            string_column(batch, "id"),
            string_column(batch, "doc_id"),
            string_column(batch, "text"),
            string_column(batch, "content_hash"),
        ) else {
            continue;
        };
        let headings = string_column(batch, "heading");
        let pages = u32_column(batch, "page");
        let indices = u32_column(batch, "chunk_index");
        let starts = u64_column(batch, "start_offset");
        let ends = u64_column(batch, "end_offset");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for i in 0..batch.num_rows() {
            let heading = headings.filter(|h| !h.is_null(i)).map(|h| h.value(i).to_string());
            hits.push(ScoredChunk {
                chunk: Chunk {
                    id: ids.value(i).to_string(),
                    document_id: doc_ids.value(i).to_string(),
                    page: pages.map(|p| p.value(i)).unwrap_or(0),
                    index: indices.map(|c| c.value(i) as usize).unwrap_or(0),
                    text: texts.value(i).to_string(),
                    heading,
                    start_offset: starts.map(|s| s.value(i) as usize).unwrap_or(0),
                    end_offset: ends.map(|e| e.value(i) as usize).unwrap_or(0),
                    content_hash: hashes.value(i).to_string(),
                    embedding: Vec::new(),
                },
                score: distances.map(|d| 1.0 - d.value(i)).unwrap_or(0.0),
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc: &str, id: &str, page: u32, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk: Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                page,
                index: 0,
                text: format!("text of {}", id),
                heading: Some("Benefits".into()),
                start_offset: 0,
                end_offset: 10,
                content_hash: format!("hash-{}", id),
                embedding: Vec::new(),
            },
            vector,
        }
    }

    #[test]
    fn test_mismatched_dimension_rejected() {
        let records = vec![record("doc-a", "a1", 1, vec![1.0, 0.0])];
        let err = LanceVectorStore::batch_for(&records, 3).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_lance_roundtrip_by_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(store.count("doc-a").await.unwrap(), 0);
        assert!(store.query("doc-a", &[1.0, 0.0, 0.0], 3).await.unwrap().is_empty());

        store
            .upsert(
                "doc-a",
                vec![
                    record("doc-a", "a1", 12, vec![1.0, 0.0, 0.0]),
                    record("doc-a", "a2", 13, vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        store
            .upsert("doc-b", vec![record("doc-b", "b1", 1, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let hits = store.query("doc-a", &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "a1");
        assert_eq!(hits[0].chunk.page, 12);
        assert_eq!(hits[0].chunk.heading.as_deref(), Some("Benefits"));
        assert!(hits[0].score > hits[1].score);

        let hashes = store.fetch_hashes("doc-a").await.unwrap();
        assert_eq!(hashes.len(), 2);

        store.delete("doc-a", &["a2".to_string()]).await.unwrap();
        assert_eq!(store.count("doc-a").await.unwrap(), 1);
        assert_eq!(store.count("doc-b").await.unwrap(), 1);
    }
}
