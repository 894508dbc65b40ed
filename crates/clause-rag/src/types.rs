use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::{Add, AddAssign};

use crate::config::RuntimeConfig;
use crate::error::{PipelineError, Result};

/// Page separator used when a document arrives as a single text blob.
pub const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// A parsed document. Immutable after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub pages: Vec<Page>,
}

impl Document {
    /// Build a document whose id is derived from its source reference, so the
    /// same URL always lands in the same vector namespace.
    pub fn new(source: impl Into<String>, pages: Vec<Page>) -> Self {
        let source = source.into();
        let id = document_id_for(&source);
        Self { id, source, pages }
    }

    pub fn with_id(id: impl Into<String>, source: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            pages,
        }
    }

    /// Split a text blob into pages on form feeds, numbering from 1.
    pub fn from_text(source: impl Into<String>, text: &str) -> Self {
        let pages = text
            .split(PAGE_BREAK)
            .enumerate()
            .map(|(i, t)| Page {
                number: i as u32 + 1,
                text: t.to_string(),
            })
            .collect();
        Self::new(source, pages)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

pub fn document_id_for(source: &str) -> String {
    let hash = blake3::hash(source.as_bytes()).to_hex();
    format!("doc-{}", &hash.as_str()[..16])
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Retrieval unit. Ids are stable across re-ingestion of the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub index: usize,
    pub text: String,
    pub heading: Option<String>,
    /// Char offsets into the page text.
    pub start_offset: usize,
    pub end_offset: usize,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl Chunk {
    pub fn make_id(document_id: &str, index: usize) -> String {
        format!("{}-c{:05}", document_id, index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Raw cosine similarity from the vector store.
    pub vector_score: f32,
    /// Raw keyword (BM25) score over the candidate pool.
    pub keyword_score: f32,
    /// `alpha * norm(vector) + (1 - alpha) * norm(keyword)`.
    pub hybrid_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    pub retrieved: RetrievedChunk,
    pub rerank_score: f32,
}

impl RankedChunk {
    pub fn chunk(&self) -> &Chunk {
        &self.retrieved.chunk
    }

    pub fn page(&self) -> u32 {
        self.retrieved.chunk.page
    }

    pub fn hybrid_score(&self) -> f32 {
        self.retrieved.hybrid_score
    }
}

/// The ranked chunks backing one decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pub chunks: Vec<RankedChunk>,
}

impl Evidence {
    /// Keep only chunks at or above the relevance threshold, preserving rank order.
    pub fn from_ranked(ranked: Vec<RankedChunk>, min_relevance: f32) -> Self {
        Self {
            chunks: ranked
                .into_iter()
                .filter(|c| c.rerank_score >= min_relevance)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_rerank_score(&self) -> f32 {
        self.chunks.iter().map(|c| c.rerank_score).sum()
    }

    pub fn pages(&self) -> BTreeSet<u32> {
        self.chunks.iter().map(|c| c.page()).collect()
    }

    pub fn top(&self) -> Option<&RankedChunk> {
        self.chunks.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClauseReference {
    pub page: Option<u32>,
    pub clause_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(rename = "isCovered")]
    pub is_covered: bool,
    pub conditions: Vec<String>,
    pub rationale: String,
    /// Always within [0, 1].
    pub confidence: f32,
    pub clause_reference: ClauseReference,
}

pub const NO_EVIDENCE_RATIONALE: &str =
    "No evidence was found in the document that addresses this question.";
pub const INSUFFICIENT_STRUCTURE_RATIONALE: &str = "insufficient structured evidence";

impl Decision {
    pub fn no_evidence() -> Self {
        Self {
            is_covered: false,
            conditions: Vec::new(),
            rationale: NO_EVIDENCE_RATIONALE.to_string(),
            confidence: 0.0,
            clause_reference: ClauseReference::default(),
        }
    }

    /// Conservative answer used when structured output cannot be obtained.
    pub fn conservative(rationale: impl Into<String>) -> Self {
        Self {
            is_covered: false,
            conditions: Vec::new(),
            rationale: rationale.into(),
            confidence: 0.0,
            clause_reference: ClauseReference::default(),
        }
    }
}

/// Clamp into [0, 1], mapping non-finite values to 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Why an answer is best-effort rather than fully reasoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// Rerank output could not be parsed; hybrid order used.
    RerankParseFailure,
    /// Rerank call failed; hybrid order used.
    RerankUnavailable,
    /// Decomposition output was unusable; heuristic split used.
    DecompositionFallback,
    /// Decision needed a repair prompt.
    DecisionRepaired,
    /// Decision stayed invalid after repair; conservative answer used.
    DecisionFallback,
    /// At least one sub-question failed; it counts as unresolved in aggregation.
    SubQuestionFailed,
    /// The consistency review call failed or its verdict was unusable.
    ConsistencyCheckFailed,
    /// The question failed outright.
    QuestionFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub model_used: String,
    pub embedding_model: String,
    pub chunks_analyzed: usize,
    pub total_tokens: Option<u64>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_reasons: Vec<DegradedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_questions: Vec<String>,
    pub contradiction_detected: bool,
    /// Verdict of the consistency review, when one ran and succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_consistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency_issues: Vec<String>,
    #[serde(default)]
    pub pages_referenced: Vec<u32>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    #[serde(rename = "isCovered")]
    pub is_covered: bool,
    pub conditions: Vec<String>,
    pub clause_reference: ClauseReference,
    pub rationale: String,
    pub confidence_score: f32,
    pub processing_metadata: ProcessingMetadata,
}

impl Answer {
    pub fn is_error(&self) -> bool {
        self.processing_metadata.error.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.processing_metadata.degraded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub documents: String,
    pub questions: Vec<String>,
}

impl QueryRequest {
    pub fn validate(&self, runtime: &RuntimeConfig) -> Result<()> {
        if self.documents.trim().is_empty() {
            return Err(PipelineError::Validation("documents must not be empty".into()));
        }
        validate_questions(&self.questions, runtime)
    }
}

pub fn validate_questions(questions: &[String], runtime: &RuntimeConfig) -> Result<()> {
    if questions.is_empty() {
        return Err(PipelineError::Validation(
            "at least one question is required".into(),
        ));
    }
    if questions.len() > runtime.max_questions_per_request {
        return Err(PipelineError::Validation(format!(
            "Maximum {} questions allowed per request",
            runtime.max_questions_per_request
        )));
    }
    for question in questions {
        if question.trim().is_empty() {
            return Err(PipelineError::Validation("Questions cannot be empty".into()));
        }
        if question.chars().count() > runtime.max_question_chars {
            return Err(PipelineError::Validation(format!(
                "Questions must be less than {} characters",
                runtime.max_question_chars
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub total_questions: usize,
    pub successful_responses: usize,
    pub failed_responses: usize,
    pub degraded_responses: usize,
    pub total_processing_time: String,
    pub document_pages_processed: Option<usize>,
    pub pages_referenced: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answers: Vec<Answer>,
    pub processing_summary: ProcessingSummary,
}
