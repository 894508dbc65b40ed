//! Keyword polarity classification of evidence passages.
//!
//! Only the sentences of a passage that mention the question's topic are
//! classified, so an unrelated exclusion elsewhere in the passage does not
//! count. Evidence is contradictory when at least one passage affirms
//! coverage and another denies it.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::search::keyword::tokenize;
use crate::types::Evidence;

/// Terms every coverage question shares; they say nothing about its topic.
static GENERIC_TERMS: LazyLock<HashSet<String>> = LazyLock::new(|| {
    tokenize(
        "cover covered covers coverage policy policies plan benefit benefits expense expenses \
         claim claims insured insurance insurer payable treatment",
    )
    .into_iter()
    .collect()
});

static NEGATIVE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(?:not covered|not be covered|does not cover|do not cover|shall not (?:be )?(?:pay|payable|cover|admissible)\w*|will not (?:be )?(?:pay|cover|reimburse)\w*|not payable|not eligible|not admissible|no coverage|no benefit|excluded|exclusions?|excludes)\b",
    )
    .expect("negative polarity regex is valid")
});

static POSITIVE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(?:covered|covers|coverage for|shall (?:pay|indemnify|reimburse)|will (?:pay|indemnify|reimburse)|payable|eligible|reimbursed|reimbursable|admissible|included|benefits? (?:is|are) available)\b",
    )
    .expect("positive polarity regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Affirms,
    Denies,
    /// Both signals in one passage, e.g. "covered, except ... excluded".
    Mixed,
    Neutral,
}

pub fn classify_polarity(text: &str) -> Polarity {
    let denies = NEGATIVE_RE.is_match(text);
    // "not covered" contains "covered"; strip negative phrases before looking for positives
    let remainder = NEGATIVE_RE.replace_all(text, " ");
    let affirms = POSITIVE_RE.is_match(&remainder);
    match (affirms, denies) {
        (true, true) => Polarity::Mixed,
        (true, false) => Polarity::Affirms,
        (false, true) => Polarity::Denies,
        (false, false) => Polarity::Neutral,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContradictionReport {
    pub affirming_pages: BTreeSet<u32>,
    pub denying_pages: BTreeSet<u32>,
}

impl ContradictionReport {
    pub fn describe(&self) -> String {
        format!(
            "Conflicting evidence: {} indicate coverage while {} indicate exclusion or non-payment.",
            pages_phrase(&self.affirming_pages),
            pages_phrase(&self.denying_pages)
        )
    }
}

fn pages_phrase(pages: &BTreeSet<u32>) -> String {
    let list: Vec<String> = pages.iter().map(|p| p.to_string()).collect();
    match list.len() {
        1 => format!("page {}", list[0]),
        _ => format!("pages {}", list.join(", ")),
    }
}

/// Stemmed question terms that identify what is being asked about.
fn topic_terms(question: &str) -> HashSet<String> {
    tokenize(question)
        .into_iter()
        .filter(|t| !GENERIC_TERMS.contains(t))
        .collect()
}

/// Sentences of `text` that share a term with the topic. With no topic terms
/// the whole text is on topic.
fn on_topic(text: &str, topic: &HashSet<String>) -> String {
    if topic.is_empty() {
        return text.to_string();
    }
    text.split(['.', ';', '\n'])
        .filter(|sentence| tokenize(sentence).iter().any(|t| topic.contains(t)))
        .collect::<Vec<_>>()
        .join(". ")
}

/// Report conflicting coverage signals about `question` across evidence
/// passages, if any.
pub fn detect_contradiction(question: &str, evidence: &Evidence) -> Option<ContradictionReport> {
    let topic = topic_terms(question);
    let mut affirming_pages = BTreeSet::new();
    let mut denying_pages = BTreeSet::new();
    for ranked in &evidence.chunks {
        match classify_polarity(&on_topic(&ranked.chunk().text, &topic)) {
            Polarity::Affirms => {
                affirming_pages.insert(ranked.page());
            }
            Polarity::Denies => {
                denying_pages.insert(ranked.page());
            }
            Polarity::Mixed | Polarity::Neutral => {}
        }
    }

    if affirming_pages.is_empty() || denying_pages.is_empty() {
        return None;
    }
    tracing::debug!(
        affirming = ?affirming_pages,
        denying = ?denying_pages,
        "Contradictory evidence detected"
    );
    Some(ContradictionReport {
        affirming_pages,
        denying_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, RankedChunk, RetrievedChunk};

    const MATERNITY: &str = "Does this policy cover maternity expenses?";

    fn ranked(page: u32, text: &str) -> RankedChunk {
        RankedChunk {
            retrieved: RetrievedChunk {
                chunk: Chunk {
                    id: format!("doc-c{:05}", page),
                    document_id: "doc".into(),
                    page,
                    index: page as usize,
                    text: text.to_string(),
                    heading: None,
                    start_offset: 0,
                    end_offset: 0,
                    content_hash: String::new(),
                    embedding: Vec::new(),
                },
                vector_score: 0.9,
                keyword_score: 1.0,
                hybrid_score: 0.9,
            },
            rerank_score: 0.9,
        }
    }

    #[test]
    fn test_polarity_classification() {
        assert_eq!(
            classify_polarity("Maternity benefits covered after 24 months continuous coverage"),
            Polarity::Affirms
        );
        assert_eq!(classify_polarity("Maternity expenses are not covered."), Polarity::Denies);
        assert_eq!(classify_polarity("Cosmetic surgery is excluded."), Polarity::Denies);
        assert_eq!(
            classify_polarity("Hospitalisation is covered, but dental treatment is excluded."),
            Polarity::Mixed
        );
        assert_eq!(classify_polarity("The policy period is one year."), Polarity::Neutral);
    }

    #[test]
    fn test_conflicting_pages_detected() {
        let evidence = Evidence {
            chunks: vec![
                ranked(12, "Maternity expenses are covered after 24 months."),
                ranked(30, "Maternity expenses are not covered under this plan."),
            ],
        };
        let report = detect_contradiction(MATERNITY, &evidence).unwrap();
        assert!(report.affirming_pages.contains(&12));
        assert!(report.denying_pages.contains(&30));
        assert!(report.describe().contains("page 30"));
    }

    #[test]
    fn test_consistent_evidence_is_not_contradictory() {
        let evidence = Evidence {
            chunks: vec![
                ranked(12, "Maternity expenses are covered after 24 months."),
                ranked(13, "The benefit is payable for up to two deliveries."),
            ],
        };
        assert!(detect_contradiction(MATERNITY, &evidence).is_none());
    }

    #[test]
    fn test_unrelated_exclusion_is_ignored() {
        let evidence = Evidence {
            chunks: vec![
                ranked(12, "Maternity expenses are covered after 24 months."),
                ranked(40, "Cosmetic surgery is excluded. Room rent is capped per day."),
                ranked(41, "Maternity benefits apply to two deliveries. Dental treatment is excluded."),
            ],
        };
        assert!(detect_contradiction(MATERNITY, &evidence).is_none());

        let on_topic_denial = Evidence {
            chunks: vec![
                ranked(12, "Maternity expenses are covered after 24 months."),
                ranked(41, "Room rent is capped. Maternity expenses are excluded for the first year."),
            ],
        };
        let report = detect_contradiction(MATERNITY, &on_topic_denial).unwrap();
        assert_eq!(report.denying_pages.into_iter().collect::<Vec<_>>(), vec![41]);
    }

    #[test]
    fn test_generic_question_classifies_whole_passage() {
        let evidence = Evidence {
            chunks: vec![
                ranked(1, "Hospitalisation expenses are covered."),
                ranked(2, "Cosmetic surgery is excluded."),
            ],
        };
        assert!(detect_contradiction("What does the policy cover?", &evidence).is_some());
    }
}
