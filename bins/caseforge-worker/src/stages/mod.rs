//! Stage handlers, one per job type
//!
//! Handlers compute and write test sets; the orchestrator owns every
//! write to the job record.

mod authoring;
mod generation;
mod judge;

pub use authoring::{ExtractMetadataHandler, GenerateSolutionHandler, GenerateTestGeneratorHandler};
pub use generation::{GenerateOutputsHandler, GenerateTestCasesHandler};
pub use judge::ExecuteSubmissionHandler;

use crate::engine::Sandbox;
use crate::error::StageError;
use crate::llm::{CollaboratorError, HintGenerator, SolutionGenerator};
use crate::pipeline::HandlerRegistry;
use caseforge_common::TestCaseRepository;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Upper bound on any single LLM call
    pub llm_timeout: Duration,
    /// Failing cases summarized in one hint request
    pub hint_case_limit: usize,
    /// Generator runs per GENERATE_TEST_CASES job unless the payload says otherwise
    pub generated_case_count: u32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(120),
            hint_case_limit: 3,
            generated_case_count: 20,
        }
    }
}

/// Collaborators shared by every handler
#[derive(Clone)]
pub struct StageDeps {
    pub sandbox: Sandbox,
    pub testcases: TestCaseRepository,
    pub author: Arc<dyn SolutionGenerator>,
    pub hints: Arc<dyn HintGenerator>,
    pub settings: StageSettings,
}

/// Registry with a handler for every job type
pub fn registry(deps: StageDeps) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(Arc::new(ExtractMetadataHandler::new(deps.clone())))
        .register(Arc::new(GenerateSolutionHandler::new(deps.clone())))
        .register(Arc::new(GenerateTestGeneratorHandler::new(deps.clone())))
        .register(Arc::new(GenerateTestCasesHandler::new(deps.clone())))
        .register(Arc::new(GenerateOutputsHandler::new(deps.clone())))
        .register(Arc::new(ExecuteSubmissionHandler::new(deps)));
    registry
}

/// Bound an LLM call; running out of time is transient
async fn with_deadline<T, F>(limit: Duration, what: &str, call: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(StageError::from),
        Err(_) => Err(StageError::Transient(format!(
            "{} timed out after {}s",
            what,
            limit.as_secs()
        ))),
    }
}

fn require<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T, StageError> {
    field
        .as_ref()
        .ok_or_else(|| StageError::Permanent(format!("payload is missing {}", name)))
}

fn ensure_supported(sandbox: &Sandbox, language: &str) -> Result<(), StageError> {
    if sandbox.supports(language) {
        Ok(())
    } else {
        Err(StageError::Permanent(format!("unsupported language: {}", language)))
    }
}
