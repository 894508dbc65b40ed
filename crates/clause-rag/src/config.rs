use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub decomposition: DecompositionConfig,
    pub decision: DecisionConfig,
    pub runtime: RuntimeConfig,
    pub models: ModelConfig,
    pub storage: StorageConfig,
}

/// Sizes are in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector store (N_v).
    pub vector_candidates: usize,
    /// Candidates kept after fusion (N_h).
    pub hybrid_top_n: usize,
    /// Weight of the normalized vector score in the fused score.
    pub alpha: f32,
    /// Candidates below this cosine similarity with zero keyword overlap are dropped.
    pub min_vector_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub snippet_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub enabled: bool,
    /// Upper bound on sub-questions (M).
    pub max_sub_questions: usize,
    /// Questions shorter than this are never decomposed.
    pub min_words: usize,
    /// Questions at least this long are always considered complex.
    pub complexity_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoveragePolicy {
    /// Covered only if every sub-question is covered (logical AND).
    AllRequired,
    /// Covered if any sub-question is covered (logical OR).
    AnyCovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum rerank score for a chunk to count as evidence.
    pub min_relevance: f32,
    /// Multiplier applied to confidence when evidence conflicts.
    pub contradiction_penalty: f32,
    pub coverage_policy: CoveragePolicy,
    pub max_evidence_chars: usize,
    /// Run a second generation pass that reviews each decision for consistency.
    pub consistency_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_concurrent_questions: usize,
    pub call_timeout_ms: u64,
    pub question_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub embed_batch_size: usize,
    pub max_questions_per_request: usize,
    pub max_question_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    Gemini,
    /// Deterministic feature hashing, no network.
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub generation_model: String,
    pub embedding_model: String,
    pub embedding_backend: EmbeddingBackend,
    pub hashing_dimension: usize,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Lance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl PipelineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunking.chunk_size == 0 {
            return Err("chunking.chunk_size must be > 0".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval.vector_candidates == 0 || self.retrieval.hybrid_top_n == 0 {
            return Err("retrieval candidate counts must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            return Err("retrieval.alpha must be in [0.0, 1.0]".into());
        }
        if self.rerank.top_k == 0 {
            return Err("rerank.top_k must be > 0".into());
        }
        if self.decomposition.max_sub_questions == 0 {
            return Err("decomposition.max_sub_questions must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.decision.min_relevance) {
            return Err("decision.min_relevance must be in [0.0, 1.0]".into());
        }
        if !(0.0..1.0).contains(&self.decision.contradiction_penalty) {
            return Err("decision.contradiction_penalty must be in [0.0, 1.0)".into());
        }
        if self.runtime.max_concurrent_questions == 0 {
            return Err("runtime.max_concurrent_questions must be > 0".into());
        }
        if self.runtime.max_attempts == 0 {
            return Err("runtime.max_attempts must be > 0".into());
        }
        if self.runtime.call_timeout_ms == 0 || self.runtime.question_timeout_ms == 0 {
            return Err("runtime timeouts must be > 0".into());
        }
        if self.runtime.embed_batch_size == 0 {
            return Err("runtime.embed_batch_size must be > 0".into());
        }
        if self.models.embedding_backend == EmbeddingBackend::Hashing
            && self.models.hashing_dimension == 0
        {
            return Err("models.hashing_dimension must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from the process environment.
    pub fn apply_env(mut self) -> Self {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.models.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.models.generation_model = model;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.models.embedding_model = model;
        }
        if let Some(v) = env_parse("MAX_CHUNK_SIZE") {
            self.chunking.chunk_size = v;
        }
        if let Some(v) = env_parse("CHUNK_OVERLAP") {
            self.chunking.chunk_overlap = v;
        }
        if let Some(v) = env_parse("MAX_RETRIEVAL_RESULTS") {
            self.retrieval.vector_candidates = v;
        }
        if let Some(v) = env_parse("RERANK_TOP_K") {
            self.rerank.top_k = v;
        }
        if let Some(v) = env_parse("MAX_QUESTIONS_PER_REQUEST") {
            self.runtime.max_questions_per_request = v;
        }
        if let Some(secs) = env_parse::<u64>("REQUEST_TIMEOUT_SECONDS") {
            self.runtime.question_timeout_ms = secs * 1000;
        }
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_millis(self.question_timeout_ms)
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 128,
            min_chunk_size: 20,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_candidates: 10,
            hybrid_top_n: 10,
            alpha: 0.7,
            min_vector_score: 0.05,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            snippet_chars: 500,
        }
    }
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sub_questions: 4,
            min_words: 5,
            complexity_words: 30,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_relevance: 0.3,
            contradiction_penalty: 0.5,
            coverage_policy: CoveragePolicy::AllRequired,
            max_evidence_chars: 6000,
            consistency_check: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_questions: 4,
            call_timeout_ms: 30_000,
            question_timeout_ms: 120_000,
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
            embed_batch_size: 100,
            max_questions_per_request: 10,
            max_question_chars: 500,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            generation_model: "gemini-2.0-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
            embedding_backend: EmbeddingBackend::Gemini,
            hashing_dimension: 1024,
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: None,
            temperature: 0.1,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./clause_rag_data"),
        }
    }
}
