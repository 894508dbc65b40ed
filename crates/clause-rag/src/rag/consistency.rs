//! Second-pass review of a finished decision against the evidence it used.
//!
//! The review never changes the decision. Its verdict is recorded in answer
//! metadata; when the review itself cannot be obtained the answer is marked
//! degraded and carries no verdict.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::types::{clamp_unit, Decision, DegradedReason, Evidence, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Revise,
    Reject,
}

impl Recommendation {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "revise" => Self::Revise,
            "reject" => Self::Reject,
            _ => Self::Accept,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub is_consistent: bool,
    pub issues: Vec<String>,
    pub validation_confidence: f32,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyOutcome {
    pub check: Option<ConsistencyCheck>,
    pub usage: TokenUsage,
    pub degraded: Option<DegradedReason>,
}

impl ConsistencyOutcome {
    fn failed(usage: TokenUsage) -> Self {
        Self {
            check: None,
            usage,
            degraded: Some(DegradedReason::ConsistencyCheckFailed),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    is_consistent: bool,
    #[serde(default, alias = "consistency_issues")]
    issues: Vec<String>,
    #[serde(default = "full_confidence")]
    validation_confidence: f64,
    #[serde(default, alias = "final_recommendation")]
    recommendation: Option<String>,
}

fn full_confidence() -> f64 {
    1.0
}

fn consistency_schema() -> JsonValue {
    json!({
        "type": "OBJECT",
        "properties": {
            "is_consistent": { "type": "BOOLEAN" },
            "consistency_issues": { "type": "ARRAY", "items": { "type": "STRING" } },
            "validation_confidence": { "type": "NUMBER" },
            "final_recommendation": { "type": "STRING", "enum": ["accept", "revise", "reject"] }
        },
        "required": ["is_consistent", "consistency_issues", "validation_confidence", "final_recommendation"]
    })
}

/// Decode a review verdict. A verdict that reports issues is never treated as
/// consistent.
pub fn parse_consistency(output: &str) -> Result<ConsistencyCheck> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(PipelineError::Parse("no JSON object in consistency review".into())),
    };
    let raw: RawCheck = serde_json::from_str(slice).map_err(|e| PipelineError::Parse(e.to_string()))?;

    let issues: Vec<String> = raw
        .issues
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();

    Ok(ConsistencyCheck {
        is_consistent: raw.is_consistent && issues.is_empty(),
        validation_confidence: clamp_unit(raw.validation_confidence as f32),
        recommendation: raw
            .recommendation
            .as_deref()
            .map(Recommendation::from_label)
            .unwrap_or(Recommendation::Accept),
        issues,
    })
}

fn build_prompt(question: &str, decision: &Decision, evidence: &Evidence, max_chars: usize) -> String {
    let mut budget = max_chars;
    let mut passages = Vec::new();
    for ranked in &evidence.chunks {
        if budget == 0 {
            break;
        }
        let text: String = ranked.chunk().text.chars().take(budget).collect();
        budget = budget.saturating_sub(text.chars().count());
        passages.push(format!("(page {}) {}", ranked.page(), text));
    }

    let conditions = if decision.conditions.is_empty() {
        "none".to_string()
    } else {
        decision.conditions.join("; ")
    };
    let page = decision
        .clause_reference
        .page
        .map(|p| p.to_string())
        .unwrap_or_else(|| "none".into());

    format!(
        "Review this coverage decision for logical consistency with its evidence.\n\n\
         Question: \"{}\"\n\
         Decision: covered = {}, confidence = {:.2}, clause page = {}\n\
         Conditions: {}\n\
         Rationale: {}\n\n\
         Evidence:\n{}\n\n\
         Check that the conditions do not contradict the coverage verdict, that the rationale \
         follows from the evidence, and that the confidence matches the strength of the evidence.\n\
         Respond with JSON containing \"is_consistent\" (boolean), \"consistency_issues\" (array of \
         strings, empty when consistent), \"validation_confidence\" (0.0-1.0) and \
         \"final_recommendation\" (\"accept\", \"revise\" or \"reject\").",
        question,
        decision.is_covered,
        decision.confidence,
        page,
        conditions,
        decision.rationale,
        passages.join("\n")
    )
}

pub struct ConsistencyValidator {
    ctx: PipelineContext,
}

impl ConsistencyValidator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn enabled(&self) -> bool {
        self.ctx.config.decision.consistency_check
    }

    /// One generation call. Failures of any kind degrade instead of erroring.
    pub async fn review(&self, question: &str, decision: &Decision, evidence: &Evidence) -> ConsistencyOutcome {
        let prompt = build_prompt(
            question,
            decision,
            evidence,
            self.ctx.config.decision.max_evidence_chars,
        );
        let schema = consistency_schema();

        let generation = match self.ctx.generate("consistency", &prompt, Some(&schema)).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(error = %e, "Consistency review unavailable");
                return ConsistencyOutcome::failed(TokenUsage::default());
            }
        };

        match parse_consistency(&generation.text) {
            Ok(check) => {
                if !check.is_consistent {
                    tracing::debug!(
                        issues = check.issues.len(),
                        recommendation = ?check.recommendation,
                        "Decision flagged as inconsistent"
                    );
                }
                ConsistencyOutcome {
                    check: Some(check),
                    usage: generation.usage,
                    degraded: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Consistency review unparseable");
                ConsistencyOutcome::failed(generation.usage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_with_issues() {
        let check = parse_consistency(
            r#"{"is_consistent": false, "consistency_issues": ["Conditions list an exclusion for a covered item"],
                "validation_confidence": 0.7, "final_recommendation": "revise"}"#,
        )
        .unwrap();
        assert!(!check.is_consistent);
        assert_eq!(check.issues.len(), 1);
        assert_eq!(check.recommendation, Recommendation::Revise);
        assert!((check.validation_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_issues_override_consistent_flag() {
        let check = parse_consistency(
            "```json\n{\"is_consistent\": true, \"consistency_issues\": [\"confidence too high\"]}\n```",
        )
        .unwrap();
        assert!(!check.is_consistent);
        assert_eq!(check.recommendation, Recommendation::Accept);
        assert_eq!(check.validation_confidence, 1.0);
    }

    #[test]
    fn test_unparseable_verdict_is_error() {
        assert!(parse_consistency("looks fine to me").is_err());
        assert!(parse_consistency(r#"{"issues": []}"#).is_err());
    }

    #[test]
    fn test_out_of_range_confidence_clamped() {
        let check = parse_consistency(
            r#"{"is_consistent": true, "consistency_issues": [], "validation_confidence": 3.5, "final_recommendation": "ACCEPT"}"#,
        )
        .unwrap();
        assert!(check.is_consistent);
        assert_eq!(check.validation_confidence, 1.0);
    }
}
