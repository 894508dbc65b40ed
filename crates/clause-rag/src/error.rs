use std::fmt;

use thiserror::Error;

/// External capability a call was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    Generation,
    VectorStore,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Generation => "generation",
            Self::VectorStore => "vector_store",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("{service} call failed: {message}")]
    ExternalService {
        service: Service,
        message: String,
        /// Network failures, rate limiting and 5xx responses. Only these are retried.
        transient: bool,
    },

    #[error("malformed structured output: {0}")]
    Parse(String),

    /// Non-fatal. Resolves to a conservative decision rather than an error answer.
    #[error("insufficient evidence: {0}")]
    InsufficientEvidence(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("batch could not be processed: {0}")]
    BatchUnavailable(String),
}

impl PipelineError {
    pub fn external(service: Service, message: impl fmt::Display, transient: bool) -> Self {
        Self::ExternalService {
            service,
            message: message.to_string(),
            transient,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ExternalService { transient: true, .. })
    }

    /// Stable label recorded in answer metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExternalService { .. } => "external_service",
            Self::Parse(_) => "parse",
            Self::InsufficientEvidence(_) => "insufficient_evidence",
            Self::Timeout { .. } => "timeout",
            Self::Validation(_) => "validation",
            Self::Config(_) => "config",
            Self::BatchUnavailable(_) => "batch_unavailable",
        }
    }

    pub fn service(&self) -> Option<Service> {
        match self {
            Self::ExternalService { service, .. } => Some(*service),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_external_errors_retry() {
        assert!(PipelineError::external(Service::Generation, "429", true).is_transient());
        assert!(!PipelineError::external(Service::Generation, "400", false).is_transient());
        assert!(!PipelineError::Parse("bad json".into()).is_transient());
        assert!(!PipelineError::timeout("generate", std::time::Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_kind_labels() {
        let err = PipelineError::external(Service::VectorStore, "unreachable", true);
        assert_eq!(err.kind(), "external_service");
        assert_eq!(err.service(), Some(Service::VectorStore));
        assert_eq!(err.to_string(), "vector_store call failed: unreachable");
        assert_eq!(PipelineError::Validation("x".into()).kind(), "validation");
    }
}
