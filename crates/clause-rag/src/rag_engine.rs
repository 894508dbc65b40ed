use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::config::{EmbeddingBackend, PipelineConfig, StorageBackend};
use crate::context::PipelineContext;
use crate::embeddings::{Embedder, HashingEmbedder};
use crate::error::{PipelineError, Result, Service};
use crate::indexing::{IndexReport, Indexer};
use crate::llm::{GeminiClient, Generator};
use crate::rag::{
    aggregate, ConsistencyCheck, ConsistencyOutcome, ConsistencyValidator, DecisionEngine, QueryDecomposer,
    QuestionTrace, ResponseAssembler, SubDecision,
};
use crate::reranking::LlmReranker;
use crate::search::HybridRetriever;
use crate::storage::{InMemoryVectorStore, LanceVectorStore, VectorStore};
use crate::types::{validate_questions, Answer, Decision, DegradedReason, Document, QueryResponse, TokenUsage};

/// Result of running one (sub-)question through retrieve, rerank and decide.
struct StepResult {
    decision: Decision,
    weight: f32,
    chunks_analyzed: usize,
    pages: BTreeSet<u32>,
    contradiction: bool,
    degraded: Vec<DegradedReason>,
    usage: TokenUsage,
    consistency: Option<ConsistencyCheck>,
}

impl QuestionTrace {
    fn absorb(&mut self, step: &StepResult) {
        self.chunks_analyzed += step.chunks_analyzed;
        self.usage += step.usage;
        self.pages_referenced.extend(step.pages.iter().copied());
        self.contradiction_detected |= step.contradiction;
        for reason in &step.degraded {
            self.mark(*reason);
        }
        if let Some(check) = &step.consistency {
            self.is_consistent = Some(self.is_consistent.unwrap_or(true) && check.is_consistent);
            for issue in &check.issues {
                if !self.consistency_issues.contains(issue) {
                    self.consistency_issues.push(issue.clone());
                }
            }
        }
    }
}

pub struct RAGEngine {
    ctx: PipelineContext,
    indexer: Indexer,
    retriever: HybridRetriever,
    reranker: LlmReranker,
    decomposer: QueryDecomposer,
    decision: DecisionEngine,
    validator: ConsistencyValidator,
    assembler: ResponseAssembler,
}

impl RAGEngine {
    pub fn new(ctx: PipelineContext) -> Self {
        let assembler = ResponseAssembler::new(ctx.generation_model(), ctx.embedding_model());
        Self {
            indexer: Indexer::new(ctx.clone()),
            retriever: HybridRetriever::new(ctx.clone()),
            reranker: LlmReranker::new(ctx.clone()),
            decomposer: QueryDecomposer::new(ctx.clone()),
            decision: DecisionEngine::new(ctx.clone()),
            validator: ConsistencyValidator::new(ctx.clone()),
            assembler,
            ctx,
        }
    }

    /// Build an engine with the capabilities selected in `config`.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let gemini = Arc::new(GeminiClient::new(&config.models)?);
        let generator: Arc<dyn Generator> = gemini.clone();
        let embedder: Arc<dyn Embedder> = match config.models.embedding_backend {
            EmbeddingBackend::Gemini => gemini,
            EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.models.hashing_dimension)?),
        };
        let store: Arc<dyn VectorStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryVectorStore::new()),
            StorageBackend::Lance => Arc::new(LanceVectorStore::open(&config.storage.data_dir).await?),
        };

        tracing::info!(
            generation_model = %generator.model_id(),
            embedding_model = %embedder.model_id(),
            storage = ?config.storage.backend,
            "Pipeline initialized"
        );
        Ok(Self::new(PipelineContext::new(config, embedder, generator, store)))
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub async fn ingest(&self, document: &Document) -> Result<IndexReport> {
        self.indexer.ingest(document).await
    }

    /// Answer one question against an ingested document. Never fails: errors
    /// become error-flagged answers.
    pub async fn answer(&self, document_id: &str, question: &str) -> Answer {
        self.answer_traced(document_id, question).await.0
    }

    /// Validate, ingest and answer a batch of questions.
    ///
    /// Questions run with bounded concurrency and are returned in request
    /// order. Individual failures are reported inline; the batch itself only
    /// fails on invalid input, failed ingestion, or when the vector store was
    /// unreachable for every question.
    pub async fn run_batch(&self, document: &Document, questions: &[String]) -> Result<QueryResponse> {
        let start = Instant::now();
        validate_questions(questions, &self.ctx.config.runtime)?;

        let report = self.ingest(document).await.map_err(|e| {
            tracing::error!(doc_id = %document.id, error = %e, "Document ingestion failed");
            PipelineError::BatchUnavailable(format!("document ingestion failed: {}", e))
        })?;

        let concurrency = self.ctx.config.runtime.max_concurrent_questions.max(1);
        let results: Vec<(Answer, Option<PipelineError>)> = futures::stream::iter(
            questions.iter().map(|q| self.answer_traced(&document.id, q)),
        )
        .buffered(concurrency)
        .collect()
        .await;

        let store_down = results
            .iter()
            .all(|(_, err)| matches!(err.as_ref().and_then(PipelineError::service), Some(Service::VectorStore)));
        if store_down {
            return Err(PipelineError::BatchUnavailable(
                "vector store unreachable for every question".into(),
            ));
        }

        let answers: Vec<Answer> = results.into_iter().map(|(answer, _)| answer).collect();
        let response = self
            .assembler
            .summarize(answers, start.elapsed(), Some(report.pages));

        let summary = &response.processing_summary;
        tracing::info!(
            doc_id = %document.id,
            total = summary.total_questions,
            successful = summary.successful_responses,
            failed = summary.failed_responses,
            degraded = summary.degraded_responses,
            elapsed = %summary.total_processing_time,
            "Batch complete"
        );
        Ok(response)
    }

    async fn answer_traced(&self, document_id: &str, question: &str) -> (Answer, Option<PipelineError>) {
        let start = Instant::now();
        let budget = self.ctx.config.runtime.question_timeout();
        let deadline = tokio::time::Instant::now() + budget;
        let mut trace = QuestionTrace::default();

        let result = match tokio::time::timeout_at(
            deadline,
            self.run_question(document_id, question, deadline, &mut trace),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::timeout("question", budget)),
        };
        trace.elapsed = start.elapsed();

        match result {
            Ok(decision) => (self.assembler.answer(question, decision, &trace), None),
            Err(e) => {
                tracing::warn!(
                    question = %question.chars().take(80).collect::<String>(),
                    error = %e,
                    kind = e.kind(),
                    "Question failed"
                );
                (self.assembler.error_answer(question, &e, &trace), Some(e))
            }
        }
    }

    async fn run_question(
        &self,
        document_id: &str,
        question: &str,
        deadline: tokio::time::Instant,
        trace: &mut QuestionTrace,
    ) -> Result<Decision> {
        let plan = self.decomposer.plan(question, 0).await;
        trace.usage += plan.usage;
        if let Some(reason) = plan.degraded {
            trace.mark(reason);
        }

        if !plan.is_decomposed() {
            let step = self.run_step(document_id, question).await?;
            trace.absorb(&step);
            return Ok(step.decision);
        }

        // Leave headroom so partial sub-results can still be aggregated
        let budget = self.ctx.config.runtime.question_timeout();
        let sub_deadline = deadline - budget / 10;
        trace.sub_questions = plan.sub_questions.clone();

        let outcomes = futures::future::join_all(plan.sub_questions.iter().map(|sub| {
            tokio::time::timeout_at(sub_deadline, self.run_step(document_id, sub))
        }))
        .await;

        let mut subs = Vec::new();
        let mut unresolved = Vec::new();
        let mut last_error = None;
        for (sub, outcome) in plan.sub_questions.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|_| Err(PipelineError::timeout("sub_question", budget)));
            match outcome {
                Ok(step) => {
                    trace.absorb(&step);
                    subs.push(SubDecision {
                        question: sub.clone(),
                        decision: step.decision,
                        weight: step.weight,
                    });
                }
                Err(e) => {
                    tracing::warn!(sub_question = %sub, error = %e, "Sub-question failed, counting it as unresolved");
                    trace.mark(DegradedReason::SubQuestionFailed);
                    unresolved.push(sub.clone());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if subs.is_empty() => Err(e),
            _ => Ok(aggregate(
                &subs,
                &unresolved,
                self.ctx.config.decision.coverage_policy,
            )),
        }
    }

    async fn run_step(&self, document_id: &str, question: &str) -> Result<StepResult> {
        let retrieved = self.retriever.retrieve(document_id, question).await?;
        let chunks_analyzed = retrieved.len();

        let rerank = self.reranker.rerank(question, retrieved).await;
        let report = self.decision.decide(question, rerank.ranked).await?;

        // Nothing to review for evidence-free or fallback decisions
        let reviewable = !report.evidence.is_empty()
            && report.outcome.degraded_reason() != Some(DegradedReason::DecisionFallback);
        let review = if self.validator.enabled() && reviewable {
            self.validator
                .review(question, report.outcome.decision(), &report.evidence)
                .await
        } else {
            ConsistencyOutcome::default()
        };

        let degraded = rerank
            .degraded
            .into_iter()
            .chain(report.outcome.degraded_reason())
            .chain(review.degraded)
            .collect();

        Ok(StepResult {
            weight: report.evidence.total_rerank_score(),
            pages: report.evidence.pages(),
            contradiction: report.contradiction.is_some(),
            usage: rerank.usage + report.usage + review.usage,
            decision: report.outcome.into_decision(),
            consistency: review.check,
            chunks_analyzed,
            degraded,
        })
    }
}
