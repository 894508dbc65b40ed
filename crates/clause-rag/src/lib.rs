pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod processing;
pub mod rag;
pub mod rag_engine;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use config::{CoveragePolicy, PipelineConfig};
pub use context::PipelineContext;
pub use error::{PipelineError, Result, Service};
pub use indexing::{IndexReport, Indexer};
pub use rag_engine::RAGEngine;
pub use types::{
    Answer, Chunk, ClauseReference, Decision, DegradedReason, Document, Page, ProcessingMetadata,
    ProcessingSummary, QueryRequest, QueryResponse,
};

// Capability traits and their bundled implementations
pub use embeddings::{Embedder, HashingEmbedder};
pub use llm::{GeminiClient, Generation, Generator};
pub use storage::{InMemoryVectorStore, LanceVectorStore, ScoredChunk, VectorRecord, VectorStore};
