use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::PipelineError;
use crate::types::{
    Answer, ClauseReference, Decision, DegradedReason, ProcessingMetadata, ProcessingSummary,
    QueryResponse, TokenUsage,
};

/// What the question pipeline learned while producing one decision.
#[derive(Debug, Clone, Default)]
pub struct QuestionTrace {
    pub chunks_analyzed: usize,
    pub usage: TokenUsage,
    pub degraded_reasons: Vec<DegradedReason>,
    pub sub_questions: Vec<String>,
    pub contradiction_detected: bool,
    pub is_consistent: Option<bool>,
    pub consistency_issues: Vec<String>,
    pub pages_referenced: BTreeSet<u32>,
    pub elapsed: Duration,
}

impl QuestionTrace {
    pub fn mark(&mut self, reason: DegradedReason) {
        if !self.degraded_reasons.contains(&reason) {
            self.degraded_reasons.push(reason);
        }
    }
}

/// Builds answers and the batch summary.
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    model_used: String,
    embedding_model: String,
}

impl ResponseAssembler {
    pub fn new(model_used: impl Into<String>, embedding_model: impl Into<String>) -> Self {
        Self {
            model_used: model_used.into(),
            embedding_model: embedding_model.into(),
        }
    }

    fn metadata(&self, trace: &QuestionTrace) -> ProcessingMetadata {
        ProcessingMetadata {
            model_used: self.model_used.clone(),
            embedding_model: self.embedding_model.clone(),
            chunks_analyzed: trace.chunks_analyzed,
            total_tokens: (trace.usage.total_tokens > 0).then_some(trace.usage.total_tokens),
            degraded: !trace.degraded_reasons.is_empty(),
            degraded_reasons: trace.degraded_reasons.clone(),
            error: None,
            error_kind: None,
            sub_questions: trace.sub_questions.clone(),
            contradiction_detected: trace.contradiction_detected,
            is_consistent: trace.is_consistent,
            consistency_issues: trace.consistency_issues.clone(),
            pages_referenced: trace.pages_referenced.iter().copied().collect(),
            elapsed_ms: trace.elapsed.as_millis() as u64,
        }
    }

    pub fn answer(&self, question: &str, decision: Decision, trace: &QuestionTrace) -> Answer {
        Answer {
            question: question.to_string(),
            is_covered: decision.is_covered,
            conditions: decision.conditions,
            clause_reference: decision.clause_reference,
            rationale: decision.rationale,
            confidence_score: decision.confidence,
            processing_metadata: self.metadata(trace),
        }
    }

    /// Error-flagged answer for a question whose pipeline failed outright.
    pub fn error_answer(&self, question: &str, error: &PipelineError, trace: &QuestionTrace) -> Answer {
        let mut trace = trace.clone();
        trace.mark(DegradedReason::QuestionFailed);
        let mut metadata = self.metadata(&trace);
        metadata.error = Some(error.to_string());
        metadata.error_kind = Some(error.kind().to_string());

        Answer {
            question: question.to_string(),
            is_covered: false,
            conditions: Vec::new(),
            clause_reference: ClauseReference::default(),
            rationale: format!("Error processing question: {}", error),
            confidence_score: 0.0,
            processing_metadata: metadata,
        }
    }

    pub fn summarize(
        &self,
        answers: Vec<Answer>,
        elapsed: Duration,
        document_pages: Option<usize>,
    ) -> QueryResponse {
        let failed = answers.iter().filter(|a| a.is_error()).count();
        let degraded = answers
            .iter()
            .filter(|a| a.is_degraded() && !a.is_error())
            .count();
        let pages: BTreeSet<u32> = answers
            .iter()
            .flat_map(|a| a.processing_metadata.pages_referenced.iter().copied())
            .collect();

        QueryResponse {
            processing_summary: ProcessingSummary {
                total_questions: answers.len(),
                successful_responses: answers.len() - failed,
                failed_responses: failed,
                degraded_responses: degraded,
                total_processing_time: format!("{:.1}s", elapsed.as_secs_f64()),
                document_pages_processed: document_pages,
                pages_referenced: pages.into_iter().collect(),
            },
            answers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Service;

    fn assembler() -> ResponseAssembler {
        ResponseAssembler::new("gemini-2.0-flash", "text-embedding-004")
    }

    #[test]
    fn test_answer_carries_metadata() {
        let mut trace = QuestionTrace {
            chunks_analyzed: 3,
            pages_referenced: [12, 13].into_iter().collect(),
            ..Default::default()
        };
        trace.mark(DegradedReason::RerankParseFailure);
        trace.mark(DegradedReason::RerankParseFailure);

        let answer = assembler().answer("q", Decision::no_evidence(), &trace);
        assert!(answer.is_degraded());
        assert_eq!(answer.processing_metadata.degraded_reasons.len(), 1);
        assert_eq!(answer.processing_metadata.pages_referenced, vec![12, 13]);
        assert_eq!(answer.processing_metadata.total_tokens, None);
    }

    #[test]
    fn test_error_answer_is_flagged() {
        let err = PipelineError::external(Service::Generation, "503", true);
        let answer = assembler().error_answer("q", &err, &QuestionTrace::default());
        assert!(answer.is_error());
        assert!(answer.is_degraded());
        assert_eq!(answer.confidence_score, 0.0);
        assert_eq!(answer.processing_metadata.error_kind.as_deref(), Some("external_service"));
    }

    #[test]
    fn test_summary_counts_and_pages() {
        let a = assembler();
        let ok = a.answer(
            "q1",
            Decision::no_evidence(),
            &QuestionTrace { pages_referenced: [12].into_iter().collect(), ..Default::default() },
        );
        let failed = a.error_answer("q2", &PipelineError::Parse("x".into()), &QuestionTrace::default());
        let response = a.summarize(vec![ok, failed], Duration::from_millis(3240), Some(20));
        let summary = &response.processing_summary;
        assert_eq!(summary.total_questions, 2);
        assert_eq!(summary.successful_responses, 1);
        assert_eq!(summary.failed_responses, 1);
        assert_eq!(summary.degraded_responses, 0);
        assert_eq!(summary.total_processing_time, "3.2s");
        assert_eq!(summary.pages_referenced, vec![12]);
    }
}
