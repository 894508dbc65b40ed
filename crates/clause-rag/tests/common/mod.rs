//! Shared fixtures for pipeline integration tests.
//!
//! The generator is scripted: each test supplies a closure that inspects the
//! prompt and returns the model's reply, so every stage runs for real against
//! the hashing embedder and the in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clause_rag::config::{EmbeddingBackend, PipelineConfig};
use clause_rag::{
    Document, Generation, Generator, HashingEmbedder, InMemoryVectorStore, Page, PipelineContext,
    PipelineError, RAGEngine, Result, ScoredChunk, Service, VectorRecord, VectorStore,
};

// ---------------------------------------------------------------------------
// Scripted generation capability
// ---------------------------------------------------------------------------

type Script = dyn Fn(&str) -> Result<String> + Send + Sync;

pub struct ScriptedGenerator {
    script: Box<Script>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new(script: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _schema: Option<&serde_json::Value>) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(prompt).map(Generation::new)
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }
}

pub fn transient_failure() -> PipelineError {
    PipelineError::external(Service::Generation, "503 Service Unavailable", true)
}

// ---------------------------------------------------------------------------
// Prompt inspection
// ---------------------------------------------------------------------------

pub fn is_rerank(prompt: &str) -> bool {
    prompt.contains("relevance judge")
}

pub fn is_decision(prompt: &str) -> bool {
    prompt.contains("expert analyst")
}

pub fn is_consistency_review(prompt: &str) -> bool {
    prompt.contains("Review this coverage decision")
}

pub fn is_decomposition(prompt: &str) -> bool {
    prompt.contains("Split the following question")
}

/// The quoted question embedded in any stage prompt.
pub fn question_of(prompt: &str) -> String {
    let marker = "Question: \"";
    prompt
        .find(marker)
        .map(|start| {
            let rest = &prompt[start + marker.len()..];
            rest[..rest.find('"').unwrap_or(rest.len())].to_string()
        })
        .unwrap_or_default()
}

/// Passage texts of a rerank prompt, in passage order.
pub fn rerank_passages(prompt: &str) -> Vec<String> {
    let mut passages: Vec<String> = Vec::new();
    let mut in_passages = false;
    for line in prompt.lines() {
        if line.starts_with("Passages:") {
            in_passages = true;
            continue;
        }
        if !in_passages {
            continue;
        }
        if line.starts_with("Return JSON") {
            break;
        }
        let starts_passage = line.starts_with('[')
            && line[1..].chars().take_while(|c| c.is_ascii_digit()).count() > 0;
        if starts_passage {
            passages.push(line.to_string());
        } else if let Some(last) = passages.last_mut() {
            last.push('\n');
            last.push_str(line);
        }
    }
    passages
}

/// Reply to a rerank prompt, scoring each passage with `score`.
pub fn rerank_reply(prompt: &str, score: impl Fn(&str) -> f32) -> String {
    let scores: Vec<serde_json::Value> = rerank_passages(prompt)
        .iter()
        .enumerate()
        .map(|(i, text)| serde_json::json!({ "passage": i + 1, "score": score(text) }))
        .collect();
    serde_json::json!({ "scores": scores }).to_string()
}

pub fn decision_reply(
    is_covered: bool,
    conditions: &[&str],
    rationale: &str,
    confidence: f32,
    page: Option<u32>,
) -> String {
    serde_json::json!({
        "isCovered": is_covered,
        "conditions": conditions,
        "rationale": rationale,
        "confidence": confidence,
        "clause_reference": { "page": page, "clause_title": null }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Accepts writes but fails every similarity query.
#[derive(Default)]
pub struct UnreachableQueryStore {
    inner: InMemoryVectorStore,
}

#[async_trait]
impl VectorStore for UnreachableQueryStore {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        self.inner.upsert(namespace, records).await
    }

    async fn query(&self, _namespace: &str, _vector: &[f32], _top_k: usize) -> Result<Vec<ScoredChunk>> {
        Err(PipelineError::external(Service::VectorStore, "connection refused", false))
    }

    async fn fetch_hashes(&self, namespace: &str) -> Result<HashMap<String, String>> {
        self.inner.fetch_hashes(namespace).await
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        self.inner.delete(namespace, ids).await
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        self.inner.count(namespace).await
    }
}

// ---------------------------------------------------------------------------
// Engine and documents
// ---------------------------------------------------------------------------

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.models.embedding_backend = EmbeddingBackend::Hashing;
    config.models.hashing_dimension = 256;
    config.chunking.chunk_size = 400;
    config.chunking.chunk_overlap = 40;
    config.chunking.min_chunk_size = 10;
    config.runtime.backoff_base_ms = 1;
    config.runtime.backoff_max_ms = 5;
    config.runtime.call_timeout_ms = 2_000;
    config.runtime.question_timeout_ms = 10_000;
    config
}

pub fn context_with(
    config: PipelineConfig,
    generator: Arc<dyn Generator>,
    store: Arc<dyn VectorStore>,
) -> PipelineContext {
    let embedder = HashingEmbedder::new(config.models.hashing_dimension).expect("valid dimension");
    PipelineContext::new(config, Arc::new(embedder), generator, store)
}

pub fn engine_with(config: PipelineConfig, generator: Arc<dyn Generator>) -> RAGEngine {
    RAGEngine::new(context_with(config, generator, Arc::new(InMemoryVectorStore::new())))
}

pub fn engine(generator: Arc<dyn Generator>) -> RAGEngine {
    engine_with(test_config(), generator)
}

/// Health policy with the maternity clause on page 12.
pub fn policy_document() -> Document {
    Document::with_id(
        "doc-health-policy",
        "https://example.com/policy.pdf",
        vec![
            Page {
                number: 1,
                text: "Policy Schedule\nThis policy indemnifies the insured person for inpatient \
                       hospitalisation expenses incurred during the policy period."
                    .into(),
            },
            Page {
                number: 12,
                text: "Maternity Benefits\nMaternity benefits covered after 24 months continuous \
                       coverage. Expenses for normal and caesarean delivery are reimbursed up to \
                       the maternity sub-limit."
                    .into(),
            },
            Page {
                number: 13,
                text: "Room Rent Limits\nRoom rent is capped at one percent of the sum insured per \
                       day. Hernia surgery is covered after a waiting period of two years. \
                       Cataract treatment is payable up to a limit per eye."
                    .into(),
            },
        ],
    )
}

pub fn questions(items: &[&str]) -> Vec<String> {
    items.iter().map(|q| q.to_string()).collect()
}
