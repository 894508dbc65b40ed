//! Question pipeline stages: decomposition, decision synthesis and answer assembly.

pub mod assembler;
pub mod consistency;
pub mod contradiction;
pub mod decision;
pub mod query_decomposer;

pub use assembler::{QuestionTrace, ResponseAssembler};
pub use consistency::{
    parse_consistency, ConsistencyCheck, ConsistencyOutcome, ConsistencyValidator, Recommendation,
};
pub use contradiction::{classify_polarity, detect_contradiction, ContradictionReport, Polarity};
pub use decision::{
    aggregate, parse_decision, DecisionEngine, DecisionOutcome, DecisionReport, DegradedDecision,
    SubDecision,
};
pub use query_decomposer::{
    decompose_query, needs_decomposition, DecompositionPlan, DecompositionStrategy,
    QueryDecomposer, MAX_DECOMPOSITION_DEPTH,
};
