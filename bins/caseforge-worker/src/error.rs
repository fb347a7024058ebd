use crate::engine::SandboxError;
use crate::llm::CollaboratorError;
use caseforge_common::types::ExecutionResult;
use caseforge_common::StoreError;

/// How a stage attempt ended when it did not complete.
/// The orchestrator turns each kind into exactly one release outcome.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Storage, queue, sandbox infrastructure or LLM trouble; retried with
    /// backoff while attempts remain
    #[error("{0}")]
    Transient(String),
    /// Malformed input or unsupported language; FAILED without retry
    #[error("{0}")]
    Permanent(String),
    /// Program under test did not compile; FAILED without retry.
    /// `results` carries per-case COMPILE_ERROR entries when judging.
    #[error("compile error: {message}")]
    Compile {
        message: String,
        results: Vec<ExecutionResult>,
    },
    /// Job was cancelled while running; nothing is written
    #[error("job was cancelled")]
    Cancelled,
    /// Another attempt owns the job now; nothing is written
    #[error("ownership of the job was lost")]
    LostOwnership,
}

impl StageError {
    pub fn compile(message: impl Into<String>) -> Self {
        StageError::Compile {
            message: message.into(),
            results: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::Permanent(_) => "permanent",
            StageError::Compile { .. } => "compile_error",
            StageError::Cancelled => "cancelled",
            StageError::LostOwnership => "lost_ownership",
        }
    }
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            StageError::Transient(format!("store: {}", e))
        } else {
            StageError::Permanent(format!("store: {}", e))
        }
    }
}

impl From<CollaboratorError> for StageError {
    fn from(e: CollaboratorError) -> Self {
        if e.is_transient() {
            StageError::Transient(format!("llm: {}", e))
        } else {
            StageError::Permanent(format!("llm: {}", e))
        }
    }
}

impl From<SandboxError> for StageError {
    fn from(e: SandboxError) -> Self {
        if e.is_infrastructure() {
            StageError::Transient(e.to_string())
        } else {
            StageError::Permanent(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let e: StageError = StoreError::Backend("connection reset".into()).into();
        assert!(matches!(e, StageError::Transient(_)));

        let e: StageError = SandboxError::UnsupportedLanguage("cobol".into()).into();
        assert!(matches!(e, StageError::Permanent(_)));
        assert_eq!(e.to_string(), "unsupported language: cobol");

        let e: StageError = SandboxError::Infrastructure("docker down".into()).into();
        assert_eq!(e.kind(), "transient");

        let e: StageError = CollaboratorError::Rejected("bad request".into()).into();
        assert_eq!(e.kind(), "permanent");
        let e: StageError = CollaboratorError::Timeout.into();
        assert_eq!(e.kind(), "transient");
    }
}
