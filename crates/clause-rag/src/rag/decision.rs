//! Evidence synthesis into a structured coverage decision.
//!
//! Generated output is decoded against a strict shape. An invalid first
//! answer gets exactly one repair prompt; if that is still invalid the engine
//! returns a conservative degraded decision instead of an error.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};

use super::contradiction::{detect_contradiction, ContradictionReport};
use crate::config::{CoveragePolicy, DecisionConfig};
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::types::{
    clamp_unit, ClauseReference, Decision, DegradedReason, Evidence, RankedChunk, TokenUsage,
    INSUFFICIENT_STRUCTURE_RATIONALE,
};

/// Best-effort decision, with the reason it is not fully reasoned.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedDecision {
    pub decision: Decision,
    pub reason: DegradedReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Decided(Decision),
    Degraded(DegradedDecision),
}

impl DecisionOutcome {
    pub fn decision(&self) -> &Decision {
        match self {
            Self::Decided(decision) => decision,
            Self::Degraded(degraded) => &degraded.decision,
        }
    }

    pub fn into_decision(self) -> Decision {
        match self {
            Self::Decided(decision) => decision,
            Self::Degraded(degraded) => degraded.decision,
        }
    }

    pub fn degraded_reason(&self) -> Option<DegradedReason> {
        match self {
            Self::Decided(_) => None,
            Self::Degraded(degraded) => Some(degraded.reason),
        }
    }
}

/// Everything one decision was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionReport {
    pub outcome: DecisionOutcome,
    pub evidence: Evidence,
    pub contradiction: Option<ContradictionReport>,
    pub usage: TokenUsage,
}

impl DecisionReport {
    fn no_evidence(evidence: Evidence) -> Self {
        Self {
            outcome: DecisionOutcome::Decided(Decision::no_evidence()),
            evidence,
            contradiction: None,
            usage: TokenUsage::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(rename = "isCovered", alias = "is_covered")]
    is_covered: bool,
    conditions: Vec<String>,
    rationale: String,
    #[serde(alias = "confidence_score")]
    confidence: f64,
    clause_reference: RawClauseReference,
}

#[derive(Debug, Deserialize)]
struct RawClauseReference {
    #[serde(default, deserialize_with = "page_number")]
    page: Option<u32>,
    #[serde(default, alias = "title")]
    clause_title: Option<String>,
}

/// Accept `12`, `"12"`, `"Page 12"` or null.
fn page_number<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(JsonValue::String(s)) => s
            .trim()
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok(),
        _ => None,
    })
}

fn decision_schema() -> JsonValue {
    json!({
        "type": "OBJECT",
        "properties": {
            "isCovered": { "type": "BOOLEAN" },
            "conditions": { "type": "ARRAY", "items": { "type": "STRING" } },
            "rationale": { "type": "STRING" },
            "confidence": { "type": "NUMBER" },
            "clause_reference": {
                "type": "OBJECT",
                "properties": {
                    "page": { "type": "INTEGER", "nullable": true },
                    "clause_title": { "type": "STRING", "nullable": true }
                }
            }
        },
        "required": ["isCovered", "conditions", "rationale", "confidence", "clause_reference"]
    })
}

/// Decode and validate generated output.
pub fn parse_decision(output: &str) -> Result<Decision> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let raw = match serde_json::from_str::<RawDecision>(trimmed) {
        Ok(raw) => raw,
        Err(first_err) => {
            let slice = match (trimmed.find('{'), trimmed.rfind('}')) {
                (Some(start), Some(end)) if start < end => &trimmed[start..=end],
                _ => return Err(PipelineError::Parse(first_err.to_string())),
            };
            serde_json::from_str::<RawDecision>(slice)
                .map_err(|e| PipelineError::Parse(e.to_string()))?
        }
    };

    if raw.rationale.trim().is_empty() {
        return Err(PipelineError::Validation("rationale must not be empty".into()));
    }
    if !raw.confidence.is_finite() {
        return Err(PipelineError::Validation("confidence must be a finite number".into()));
    }

    Ok(Decision {
        is_covered: raw.is_covered,
        conditions: raw.conditions,
        rationale: raw.rationale.trim().to_string(),
        confidence: clamp_unit(raw.confidence as f32),
        clause_reference: ClauseReference {
            page: raw.clause_reference.page,
            clause_title: raw
                .clause_reference
                .clause_title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        },
    })
}

fn require_evidence(evidence: &Evidence, min_relevance: f32) -> Result<()> {
    if evidence.is_empty() {
        return Err(PipelineError::InsufficientEvidence(format!(
            "no passage reached relevance {:.2}",
            min_relevance
        )));
    }
    Ok(())
}

pub struct DecisionEngine {
    ctx: PipelineContext,
}

impl DecisionEngine {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Decide `question` from ranked chunks.
    ///
    /// Only external failures of the first generation call are returned as
    /// errors. Missing evidence and malformed output resolve to decisions.
    pub async fn decide(&self, question: &str, ranked: Vec<RankedChunk>) -> Result<DecisionReport> {
        let config = &self.ctx.config.decision;
        let evidence = Evidence::from_ranked(ranked, config.min_relevance);

        if let Err(e) = require_evidence(&evidence, config.min_relevance) {
            tracing::debug!(reason = %e, "Answering without evidence");
            return Ok(DecisionReport::no_evidence(evidence));
        }

        let contradiction = detect_contradiction(question, &evidence);
        let prompt = build_prompt(question, &evidence, contradiction.as_ref(), config.max_evidence_chars);
        let schema = decision_schema();

        let first = self.ctx.generate("decide", &prompt, Some(&schema)).await?;
        let mut usage = first.usage;

        let outcome = match parse_decision(&first.text) {
            Ok(decision) => DecisionOutcome::Decided(decision),
            Err(e) => {
                tracing::warn!(error = %e, "Decision output invalid, issuing repair prompt");
                let repair = repair_prompt(&prompt, &first.text, &e);
                match self.ctx.generate("decide_repair", &repair, Some(&schema)).await {
                    Ok(second) => {
                        usage += second.usage;
                        match parse_decision(&second.text) {
                            Ok(decision) => DecisionOutcome::Degraded(DegradedDecision {
                                decision,
                                reason: DegradedReason::DecisionRepaired,
                            }),
                            Err(e) => {
                                tracing::warn!(error = %e, "Repaired decision still invalid, answering conservatively");
                                conservative()
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Repair call failed, answering conservatively");
                        conservative()
                    }
                }
            }
        };

        let outcome = match outcome {
            DecisionOutcome::Decided(decision) => {
                DecisionOutcome::Decided(finalize(decision, &evidence, contradiction.as_ref(), config))
            }
            DecisionOutcome::Degraded(DegradedDecision { decision, reason })
                if reason == DegradedReason::DecisionRepaired =>
            {
                DecisionOutcome::Degraded(DegradedDecision {
                    decision: finalize(decision, &evidence, contradiction.as_ref(), config),
                    reason,
                })
            }
            fallback => fallback,
        };

        Ok(DecisionReport {
            outcome,
            evidence,
            contradiction,
            usage,
        })
    }
}

fn conservative() -> DecisionOutcome {
    DecisionOutcome::Degraded(DegradedDecision {
        decision: Decision::conservative(INSUFFICIENT_STRUCTURE_RATIONALE),
        reason: DegradedReason::DecisionFallback,
    })
}

fn build_prompt(
    question: &str,
    evidence: &Evidence,
    contradiction: Option<&ContradictionReport>,
    max_evidence_chars: usize,
) -> String {
    let mut budget = max_evidence_chars;
    let mut passages = Vec::new();
    for (i, ranked) in evidence.chunks.iter().enumerate() {
        if budget == 0 {
            break;
        }
        let text: String = ranked.chunk().text.chars().take(budget).collect();
        budget = budget.saturating_sub(text.chars().count());
        let heading = ranked
            .chunk()
            .heading
            .as_deref()
            .map(|h| format!(" [{}]", h))
            .unwrap_or_default();
        passages.push(format!(
            "Passage {} (page {}{}, relevance {:.2}):\n{}",
            i + 1,
            ranked.page(),
            heading,
            ranked.rerank_score,
            text
        ));
    }

    let conflict_note = contradiction
        .map(|c| {
            format!(
                "\nThe passages appear to disagree. {} Address this conflict explicitly in the rationale.\n",
                c.describe()
            )
        })
        .unwrap_or_default();

    format!(
        "You are an expert analyst of insurance policies, contracts and HR documents. Answer the \
         question using ONLY the passages below.\n\n\
         Question: \"{}\"\n\n\
         Passages:\n{}\n{}\n\
         Respond with JSON containing:\n\
         - \"isCovered\": true only if the passages state that the item is covered or permitted\n\
         - \"conditions\": waiting periods, limits, sub-limits or prerequisites that apply, in order\n\
         - \"rationale\": a short explanation citing the passages\n\
         - \"confidence\": a number between 0.0 and 1.0\n\
         - \"clause_reference\": {{\"page\": page number of the deciding passage, \"clause_title\": its title or null}}",
        question,
        passages.join("\n\n"),
        conflict_note
    )
}

fn repair_prompt(original_prompt: &str, previous_output: &str, error: &PipelineError) -> String {
    let previous: String = previous_output.chars().take(1500).collect();
    format!(
        "{}\n\nYour previous answer could not be used ({}).\nPrevious answer:\n{}\n\n\
         Reply again with a single JSON object containing exactly the fields isCovered (boolean), \
         conditions (array of strings), rationale (string), confidence (number 0.0-1.0) and \
         clause_reference (object with page and clause_title). No other text.",
        original_prompt, error, previous
    )
}

/// Ground the decision in its evidence: clamp confidence, fix the clause
/// reference to a page that was actually used, tidy conditions and apply the
/// contradiction penalty.
fn finalize(
    mut decision: Decision,
    evidence: &Evidence,
    contradiction: Option<&ContradictionReport>,
    config: &DecisionConfig,
) -> Decision {
    decision.confidence = clamp_unit(decision.confidence);

    let mut seen = HashSet::new();
    decision.conditions = decision
        .conditions
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.to_lowercase()))
        .collect();

    let pages = evidence.pages();
    let page = match decision.clause_reference.page {
        Some(p) if pages.contains(&p) => Some(p),
        _ => evidence.top().map(|top| top.page()),
    };
    if decision.clause_reference.clause_title.is_none() {
        decision.clause_reference.clause_title = evidence
            .chunks
            .iter()
            .filter(|c| Some(c.page()) == page)
            .find_map(|c| c.chunk().heading.clone());
    }
    decision.clause_reference.page = page;

    if let Some(report) = contradiction {
        decision.confidence = clamp_unit(decision.confidence * config.contradiction_penalty);
        decision.rationale = format!("{} {}", decision.rationale, report.describe());
    }
    decision
}

/// One sub-question's decision and the evidence weight behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDecision {
    pub question: String,
    pub decision: Decision,
    /// Total rerank score of the evidence used.
    pub weight: f32,
}

/// Combine sub-decisions into one decision.
///
/// Confidence is the evidence-weighted mean of sub-confidences (0 when no
/// sub-decision had evidence). Coverage follows `policy`: with
/// `AllRequired` every aspect must be covered, with `AnyCovered` one suffices.
/// `unresolved` lists sub-questions that failed; they carry no weight but
/// count as not covered.
pub fn aggregate(subs: &[SubDecision], unresolved: &[String], policy: CoveragePolicy) -> Decision {
    if subs.is_empty() {
        return Decision::no_evidence();
    }

    let total_weight: f32 = subs.iter().map(|s| s.weight.max(0.0)).sum();
    let confidence = if total_weight > 0.0 {
        subs.iter()
            .map(|s| s.weight.max(0.0) * s.decision.confidence)
            .sum::<f32>()
            / total_weight
    } else {
        0.0
    };

    let is_covered = match policy {
        CoveragePolicy::AllRequired => {
            unresolved.is_empty() && subs.iter().all(|s| s.decision.is_covered)
        }
        CoveragePolicy::AnyCovered => subs.iter().any(|s| s.decision.is_covered),
    };

    let mut seen = HashSet::new();
    let conditions = subs
        .iter()
        .flat_map(|s| s.decision.conditions.iter())
        .filter(|c| seen.insert(c.to_lowercase()))
        .cloned()
        .collect();

    let rationale = subs
        .iter()
        .map(|s| format!("{}: {}", s.question, s.decision.rationale))
        .chain(unresolved.iter().map(|q| format!("{}: could not be answered.", q)))
        .collect::<Vec<_>>()
        .join("\n");

    // Reference the strongest covered aspect, else the best-supported one
    let anchor = subs
        .iter()
        .filter(|s| s.decision.is_covered && s.decision.clause_reference.page.is_some())
        .max_by(|a, b| a.decision.confidence.total_cmp(&b.decision.confidence))
        .or_else(|| {
            subs.iter()
                .filter(|s| s.decision.clause_reference.page.is_some())
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
        });

    Decision {
        is_covered,
        conditions,
        rationale,
        confidence: clamp_unit(confidence),
        clause_reference: anchor
            .map(|s| s.decision.clause_reference.clone())
            .unwrap_or_default(),
    }
}
