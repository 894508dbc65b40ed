pub mod llm_reranker;

pub use llm_reranker::{compare_ranked, hybrid_order, LlmReranker, RerankOutcome};
