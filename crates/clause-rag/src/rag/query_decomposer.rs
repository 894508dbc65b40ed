//! Query Decomposition Module
//!
//! Splits complex multi-part questions into at most `max_sub_questions`
//! independent sub-questions. A fixed heuristic decides whether to decompose;
//! the generation capability proposes the split, and the regex strategies
//! below take over when its output is unusable.
//!
//! Decomposition is one level deep. Sub-questions are never decomposed again.

use std::collections::HashSet;
use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::config::DecompositionConfig;
use crate::context::PipelineContext;
use crate::types::{DegradedReason, TokenUsage};

/// Depth at which `plan` stops decomposing.
pub const MAX_DECOMPOSITION_DEPTH: usize = 1;

static CONJUNCTION_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:and also|and then|and|also|additionally|plus|as well as)\b")
        .expect("conjunction regex is valid")
});

static QUESTION_MARK_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\?\s+").expect("question mark split regex is valid")
});

static ENUMERATED_SPLIT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?:^|\s)(?:\d+[.)]|[-•])\s+").expect("enumerated regex is valid")
});

static COMPARATIVE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(?:compare|difference between|versus|vs\.?|differ from)\b")
        .expect("comparative regex is valid")
});

static BETWEEN_ENTITIES_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)between\s+(.+?)\s+and\s+(.+?)(?:\s|$|\?)")
        .expect("between entities regex is valid")
});

/// Phrases where "and" joins one concept rather than two questions.
const NON_SPLIT_PHRASES: &[&str] = &[
    "terms and conditions",
    "rules and regulations",
    "pre and post",
    "accident and emergency",
    "advantages and disadvantages",
    "pros and cons",
    "name and address",
    "trial and error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompositionStrategy {
    /// Question was not decomposed (single intent)
    Single,
    /// Sub-questions proposed by the generation capability
    Generated,
    /// Split on conjunctions ("X and Y")
    Conjunction,
    /// Split on multiple question marks
    MultiQuestion,
    /// Enumerated items ("1. X 2. Y")
    Enumerated,
    /// Comparative question decomposed into per-entity questions
    Comparative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionPlan {
    pub original: String,
    /// Never empty, never longer than `max_sub_questions`.
    pub sub_questions: Vec<String>,
    pub strategy: DecompositionStrategy,
    pub degraded: Option<DegradedReason>,
    pub usage: TokenUsage,
}

impl DecompositionPlan {
    pub fn single(question: &str) -> Self {
        Self {
            original: question.to_string(),
            sub_questions: vec![question.to_string()],
            strategy: DecompositionStrategy::Single,
            degraded: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn is_decomposed(&self) -> bool {
        self.strategy != DecompositionStrategy::Single && self.sub_questions.len() > 1
    }
}

#[derive(Debug, Deserialize)]
struct SubQuestionList {
    sub_questions: Vec<String>,
}

fn decomposition_schema() -> JsonValue {
    json!({
        "type": "OBJECT",
        "properties": {
            "sub_questions": { "type": "ARRAY", "items": { "type": "STRING" } }
        },
        "required": ["sub_questions"]
    })
}

/// Fixed heuristic: multiple question marks, enumerations, comparisons,
/// independent clauses joined by a conjunction, or sheer length.
pub fn needs_decomposition(question: &str, config: &DecompositionConfig) -> bool {
    let question = question.trim();
    let words = question.split_whitespace().count();
    if words < config.min_words {
        return false;
    }
    if words >= config.complexity_words {
        return true;
    }
    question.matches('?').count() >= 2
        || extract_enumerated(question).len() >= 2
        || COMPARATIVE_RE.is_match(question)
        || conjunction_parts(question).is_some()
}

/// Regex-only decomposition, used when generated output is unusable.
/// Returns at most `max_sub_questions` entries.
pub fn decompose_query(question: &str, max_sub_questions: usize) -> (Vec<String>, DecompositionStrategy) {
    let question = question.trim();
    let max = max_sub_questions.max(1);

    // Try each decomposition strategy in order of specificity
    let (mut parts, strategy) = {
        let enumerated = extract_enumerated(question);
        if enumerated.len() >= 2 {
            (enumerated, DecompositionStrategy::Enumerated)
        } else {
            let questions = split_on_question_marks(question);
            if questions.len() >= 2 {
                (questions, DecompositionStrategy::MultiQuestion)
            } else if let Some(comparative) = comparative_parts(question) {
                (comparative, DecompositionStrategy::Comparative)
            } else if let Some(conjunction) = conjunction_parts(question) {
                (conjunction, DecompositionStrategy::Conjunction)
            } else {
                (vec![question.to_string()], DecompositionStrategy::Single)
            }
        }
    };

    parts = dedupe(parts);
    parts.truncate(max);
    if parts.len() < 2 {
        return (vec![question.to_string()], DecompositionStrategy::Single);
    }
    (parts, strategy)
}

fn extract_enumerated(question: &str) -> Vec<String> {
    if ENUMERATED_SPLIT_RE.find_iter(question).count() < 2 {
        return Vec::new();
    }
    ENUMERATED_SPLIT_RE
        .split(question)
        .map(|s| s.trim().to_string())
        .filter(|s| s.split_whitespace().count() >= 2)
        .collect()
}

fn split_on_question_marks(question: &str) -> Vec<String> {
    QUESTION_MARK_SPLIT_RE
        .split(question)
        .map(|s| {
            let s = s.trim();
            if s.ends_with('?') || s.is_empty() {
                s.to_string()
            } else {
                format!("{}?", s)
            }
        })
        .filter(|s| s.split_whitespace().count() >= 2)
        .collect()
}

fn comparative_parts(question: &str) -> Option<Vec<String>> {
    if !COMPARATIVE_RE.is_match(question) {
        return None;
    }
    let cap = BETWEEN_ENTITIES_RE.captures(question)?;
    let entity_a = cap.get(1)?.as_str().trim();
    let entity_b = cap.get(2)?.as_str().trim();
    if entity_a.split_whitespace().count() > 5 || entity_b.split_whitespace().count() > 5 {
        return None;
    }
    Some(vec![
        format!("What does the document say about {}?", entity_a),
        format!("What does the document say about {}?", entity_b),
        question.to_string(),
    ])
}

fn conjunction_parts(question: &str) -> Option<Vec<String>> {
    let lower = question.to_lowercase();
    if NON_SPLIT_PHRASES.iter().any(|p| lower.contains(p)) {
        return None;
    }

    // Each part must have enough substance to be a standalone question
    let parts: Vec<String> = CONJUNCTION_SPLIT_RE
        .split(question)
        .map(|p| p.trim().trim_matches(',').trim().to_string())
        .filter(|p| p.split_whitespace().count() >= 3)
        .collect();
    (parts.len() >= 2).then_some(parts)
}

/// Drop blanks and case-insensitive duplicates, keeping first occurrences.
fn dedupe(parts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && seen.insert(p.to_lowercase()))
        .collect()
}

/// Parse generated output into a list of sub-questions.
fn parse_sub_questions(output: &str) -> Option<Vec<String>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(list) = serde_json::from_str::<SubQuestionList>(trimmed) {
        return Some(list.sub_questions);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(list) = serde_json::from_str::<SubQuestionList>(&trimmed[start..=end]) {
                return Some(list.sub_questions);
            }
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(list) = serde_json::from_str::<Vec<String>>(&trimmed[start..=end]) {
                return Some(list);
            }
        }
    }
    None
}

pub struct QueryDecomposer {
    ctx: PipelineContext,
}

impl QueryDecomposer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Plan execution for `question` at the given decomposition `depth`.
    pub async fn plan(&self, question: &str, depth: usize) -> DecompositionPlan {
        let config = &self.ctx.config.decomposition;
        if !config.enabled
            || depth >= MAX_DECOMPOSITION_DEPTH
            || !needs_decomposition(question, config)
        {
            return DecompositionPlan::single(question);
        }

        let max = config.max_sub_questions.max(1);
        let prompt = format!(
            "Split the following question about a policy or contract document into at most {} \
             independent sub-questions. Each sub-question must be answerable on its own from the \
             document and must not overlap with the others. If the question has a single intent, \
             return it unchanged as the only item.\n\n\
             Question: \"{}\"\n\n\
             Return JSON: {{\"sub_questions\": [\"...\"]}}",
            max, question
        );

        let schema = decomposition_schema();
        let (parsed, usage) = match self.ctx.generate("decompose", &prompt, Some(&schema)).await {
            Ok(generation) => (parse_sub_questions(&generation.text), generation.usage),
            Err(e) => {
                tracing::warn!(error = %e, "Decomposition call failed, using heuristic split");
                (None, TokenUsage::default())
            }
        };

        let max_chars = self.ctx.config.runtime.max_question_chars;
        let generated = parsed.map(|subs| {
            let mut subs: Vec<String> = dedupe(subs)
                .into_iter()
                .filter(|s| s.chars().count() <= max_chars)
                .collect();
            subs.truncate(max);
            subs
        });

        match generated {
            Some(subs) if subs.len() >= 2 => {
                tracing::debug!(count = subs.len(), "Question decomposed");
                DecompositionPlan {
                    original: question.to_string(),
                    sub_questions: subs,
                    strategy: DecompositionStrategy::Generated,
                    degraded: None,
                    usage,
                }
            }
            Some(subs) if subs.len() == 1 => DecompositionPlan {
                usage,
                ..DecompositionPlan::single(question)
            },
            _ => {
                let (sub_questions, strategy) = decompose_query(question, max);
                tracing::warn!(
                    strategy = ?strategy,
                    count = sub_questions.len(),
                    "Decomposition output unusable, using heuristic split"
                );
                DecompositionPlan {
                    original: question.to_string(),
                    sub_questions,
                    strategy,
                    degraded: Some(DegradedReason::DecompositionFallback),
                    usage,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DecompositionConfig {
        DecompositionConfig::default()
    }

    #[test]
    fn test_single_question_not_decomposed() {
        assert!(!needs_decomposition("Does this policy cover maternity expenses?", &config()));
        let (subs, strategy) = decompose_query("Does this policy cover maternity expenses?", 4);
        assert_eq!(strategy, DecompositionStrategy::Single);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_short_question_not_decomposed() {
        assert!(!needs_decomposition("Dental and vision?", &config()));
    }

    #[test]
    fn test_multi_question_decomposition() {
        let q = "What is the grace period for premium payment? Is cataract surgery covered?";
        assert!(needs_decomposition(q, &config()));
        let (subs, strategy) = decompose_query(q, 4);
        assert_eq!(strategy, DecompositionStrategy::MultiQuestion);
        assert_eq!(subs.len(), 2);
        assert!(subs[1].contains("cataract"));
    }

    #[test]
    fn test_conjunction_decomposition() {
        let q = "Does this policy cover knee surgery, and what are the conditions?";
        assert!(needs_decomposition(q, &config()));
        let (subs, strategy) = decompose_query(q, 4);
        assert_eq!(strategy, DecompositionStrategy::Conjunction);
        assert_eq!(subs, vec!["Does this policy cover knee surgery", "what are the conditions?"]);
    }

    #[test]
    fn test_terms_and_conditions_not_split() {
        let q = "What are the terms and conditions for organ donor expenses";
        assert!(!needs_decomposition(q, &config()));
    }

    #[test]
    fn test_enumerated_decomposition() {
        let q = "1. What is the waiting period 2. What is the room rent cap 3. Is AYUSH covered";
        let (subs, strategy) = decompose_query(q, 4);
        assert_eq!(strategy, DecompositionStrategy::Enumerated);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_comparative_decomposition() {
        let q = "What is the difference between cashless claims and reimbursement claims";
        let (subs, strategy) = decompose_query(q, 4);
        assert_eq!(strategy, DecompositionStrategy::Comparative);
        assert!(subs.len() >= 2);
    }

    #[test]
    fn test_sub_question_count_is_bounded() {
        let q = "Is A covered? Is B covered? Is C covered? Is D covered? Is E covered? Is F covered?";
        for max in 1..=5 {
            let (subs, _) = decompose_query(q, max);
            assert!(subs.len() <= max);
        }
    }

    #[test]
    fn test_parse_sub_questions() {
        assert_eq!(
            parse_sub_questions(r#"{"sub_questions": ["a b", "c d"]}"#),
            Some(vec!["a b".to_string(), "c d".to_string()])
        );
        assert_eq!(
            parse_sub_questions("```json\n[\"x y\"]\n```"),
            Some(vec!["x y".to_string()])
        );
        assert_eq!(parse_sub_questions("no idea"), None);
    }
}
