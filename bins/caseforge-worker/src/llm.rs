//! LLM collaborator boundary
//!
//! Prompts and model choice live behind an HTTP service; this side only
//! sees typed requests and responses. Anything the service returns is
//! validated here, so stages never handle half-formed artifacts.

use async_trait::async_trait;
use caseforge_common::types::{
    ExecutionResult, ExecutionStatus, ProblemMetadata, SamplePair, SourceCode, TestCase,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Longest input/output excerpt sent in a hint request
const SUMMARY_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("request timed out")]
    Timeout,
    /// Connection failures and 5xx/429 responses
    #[error("http error: {0}")]
    Http(String),
    /// Response arrived but does not have the promised shape
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The service refused the request itself (4xx); retrying will not help
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, CollaboratorError::Rejected(_))
    }
}

/// Bounded description of one failing case, as sent for hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedCase {
    pub testcase_id: u32,
    pub input: String,
    pub expected_output: Option<String>,
    pub actual_output: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

fn clip(text: &str) -> String {
    match text.char_indices().nth(SUMMARY_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

impl FailedCase {
    pub fn summarize(case: &TestCase, result: &ExecutionResult) -> Self {
        Self {
            testcase_id: result.testcase_id,
            input: clip(&case.input),
            expected_output: case.expected_output.as_deref().map(clip),
            actual_output: clip(&result.actual_output),
            status: result.status,
            error: result.error.as_deref().map(clip),
        }
    }
}

/// Authoring side of the pipeline
#[async_trait]
pub trait SolutionGenerator: Send + Sync {
    async fn extract_metadata(&self, url: &str) -> Result<ProblemMetadata, CollaboratorError>;

    async fn generate_solution(
        &self,
        metadata: &ProblemMetadata,
    ) -> Result<SourceCode, CollaboratorError>;

    /// Program that prints one test input for the case index read on stdin
    async fn generate_test_generator(
        &self,
        metadata: &ProblemMetadata,
        solution: &SourceCode,
    ) -> Result<SourceCode, CollaboratorError>;
}

#[async_trait]
pub trait HintGenerator: Send + Sync {
    async fn generate_hints(&self, failed: &[FailedCase]) -> Result<Vec<String>, CollaboratorError>;
}

/// Drop a surrounding markdown code fence, if the model added one
pub fn strip_code_fence(code: &str) -> String {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return code.to_string();
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    let body = body.trim_end().strip_suffix("```").unwrap_or(body);
    format!("{}\n", body.trim_end_matches('\n'))
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    title: String,
    #[serde(default)]
    constraints: String,
    #[serde(default)]
    samples: Vec<SamplePair>,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: String,
    language: String,
}

#[derive(Debug, Deserialize)]
struct HintsResponse {
    hints: Vec<String>,
}

fn validate_metadata(response: MetadataResponse) -> Result<ProblemMetadata, CollaboratorError> {
    if response.title.trim().is_empty() {
        return Err(CollaboratorError::Malformed("metadata has an empty title".into()));
    }
    if let Some(i) = response.samples.iter().position(|s| s.input.trim().is_empty()) {
        return Err(CollaboratorError::Malformed(format!("sample {} has an empty input", i + 1)));
    }
    Ok(ProblemMetadata {
        title: response.title.trim().to_string(),
        constraints: response.constraints,
        samples: response.samples,
    })
}

fn validate_code(response: CodeResponse) -> Result<SourceCode, CollaboratorError> {
    let code = strip_code_fence(&response.code);
    if code.trim().is_empty() {
        return Err(CollaboratorError::Malformed("empty source code".into()));
    }
    let language = response.language.trim().to_lowercase();
    if language.is_empty() {
        return Err(CollaboratorError::Malformed("missing language".into()));
    }
    Ok(SourceCode::new(code, language))
}

/// Client for the generation service.
///
/// `POST {endpoint}/extract-metadata`, `/generate-solution`,
/// `/generate-test-generator`, `/generate-hints`, all JSON.
#[derive(Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, CollaboratorError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Timeout
            } else {
                CollaboratorError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "LLM collaborator responded");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("{}: {}", status.as_u16(), clip(&body));
            let retryable = status.is_server_error()
                || status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::REQUEST_TIMEOUT;
            return Err(if retryable {
                CollaboratorError::Http(detail)
            } else {
                CollaboratorError::Rejected(detail)
            });
        }

        response.json::<Resp>().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Timeout
            } else {
                CollaboratorError::Malformed(e.to_string())
            }
        })
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct SolutionRequest<'a> {
    metadata: &'a ProblemMetadata,
}

#[derive(Serialize)]
struct GeneratorRequest<'a> {
    metadata: &'a ProblemMetadata,
    solution: &'a SourceCode,
}

#[derive(Serialize)]
struct HintsRequest<'a> {
    failed_cases: &'a [FailedCase],
}

#[async_trait]
impl SolutionGenerator for HttpLlmClient {
    async fn extract_metadata(&self, url: &str) -> Result<ProblemMetadata, CollaboratorError> {
        let response: MetadataResponse = self.call("extract-metadata", &ExtractRequest { url }).await?;
        validate_metadata(response)
    }

    async fn generate_solution(
        &self,
        metadata: &ProblemMetadata,
    ) -> Result<SourceCode, CollaboratorError> {
        let response: CodeResponse = self
            .call("generate-solution", &SolutionRequest { metadata })
            .await?;
        validate_code(response)
    }

    async fn generate_test_generator(
        &self,
        metadata: &ProblemMetadata,
        solution: &SourceCode,
    ) -> Result<SourceCode, CollaboratorError> {
        let response: CodeResponse = self
            .call(
                "generate-test-generator",
                &GeneratorRequest { metadata, solution },
            )
            .await?;
        validate_code(response)
    }
}

#[async_trait]
impl HintGenerator for HttpLlmClient {
    async fn generate_hints(&self, failed: &[FailedCase]) -> Result<Vec<String>, CollaboratorError> {
        let response: HintsResponse = self
            .call("generate-hints", &HintsRequest { failed_cases: failed })
            .await?;
        Ok(response
            .hints
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect())
    }
}

/// Stand-in used when no endpoint is configured; every call is rejected
pub struct UnconfiguredLlm;

const UNCONFIGURED: &str = "LLM_ENDPOINT is not configured";

#[async_trait]
impl SolutionGenerator for UnconfiguredLlm {
    async fn extract_metadata(&self, _url: &str) -> Result<ProblemMetadata, CollaboratorError> {
        Err(CollaboratorError::Rejected(UNCONFIGURED.into()))
    }

    async fn generate_solution(&self, _: &ProblemMetadata) -> Result<SourceCode, CollaboratorError> {
        Err(CollaboratorError::Rejected(UNCONFIGURED.into()))
    }

    async fn generate_test_generator(
        &self,
        _: &ProblemMetadata,
        _: &SourceCode,
    ) -> Result<SourceCode, CollaboratorError> {
        Err(CollaboratorError::Rejected(UNCONFIGURED.into()))
    }
}

#[async_trait]
impl HintGenerator for UnconfiguredLlm {
    async fn generate_hints(&self, _: &[FailedCase]) -> Result<Vec<String>, CollaboratorError> {
        Err(CollaboratorError::Rejected(UNCONFIGURED.into()))
    }
}
