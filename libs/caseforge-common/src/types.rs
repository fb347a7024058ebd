use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Pipeline stage a job record drives.
///
/// One stage per job record; stages are chained by creating the
/// successor's record once the predecessor completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    ExtractMetadata,
    GenerateSolution,
    GenerateTestGenerator,
    GenerateTestCases,
    GenerateOutputs,
    ExecuteSubmission,
}

impl JobType {
    pub fn all_variants() -> &'static [JobType] {
        &[
            JobType::ExtractMetadata,
            JobType::GenerateSolution,
            JobType::GenerateTestGenerator,
            JobType::GenerateTestCases,
            JobType::GenerateOutputs,
            JobType::ExecuteSubmission,
        ]
    }

    /// Stage created after this one completes. Submission execution and
    /// output generation are the ends of their chains.
    pub fn next_stage(self) -> Option<JobType> {
        match self {
            JobType::ExtractMetadata => Some(JobType::GenerateSolution),
            JobType::GenerateSolution => Some(JobType::GenerateTestGenerator),
            JobType::GenerateTestGenerator => Some(JobType::GenerateTestCases),
            JobType::GenerateTestCases => Some(JobType::GenerateOutputs),
            JobType::GenerateOutputs => None,
            JobType::ExecuteSubmission => None,
        }
    }

    /// Queue partition the stage is delivered on. Judge traffic is kept
    /// apart from slow generation and LLM work.
    pub fn queue(self) -> QueueKind {
        match self {
            JobType::ExecuteSubmission => QueueKind::Submission,
            JobType::GenerateTestCases | JobType::GenerateOutputs => QueueKind::Generation,
            JobType::ExtractMetadata
            | JobType::GenerateSolution
            | JobType::GenerateTestGenerator => QueueKind::Ai,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::ExtractMetadata => "EXTRACT_METADATA",
            JobType::GenerateSolution => "GENERATE_SOLUTION",
            JobType::GenerateTestGenerator => "GENERATE_TEST_GENERATOR",
            JobType::GenerateTestCases => "GENERATE_TEST_CASES",
            JobType::GenerateOutputs => "GENERATE_OUTPUTS",
            JobType::ExecuteSubmission => "EXECUTE_SUBMISSION",
        }
    }

    /// Parse a job type (case-insensitive, `-` and `_` interchangeable)
    pub fn from_str(s: &str) -> Option<JobType> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::all_variants()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority partition of the queue transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Submission,
    Generation,
    Ai,
}

impl QueueKind {
    pub fn all_variants() -> &'static [QueueKind] {
        &[QueueKind::Submission, QueueKind::Generation, QueueKind::Ai]
    }

    pub fn index(self) -> usize {
        match self {
            QueueKind::Submission => 0,
            QueueKind::Generation => 1,
            QueueKind::Ai => 2,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Submission => write!(f, "submission"),
            QueueKind::Generation => write!(f, "generation"),
            QueueKind::Ai => write!(f, "ai"),
        }
    }
}

/// Job State Machine
///
/// Forward only: PENDING -> PROCESSING -> {COMPLETED, FAILED}.
/// PROCESSING -> PENDING happens only through a retry release or an orphan
/// reclaim. CANCELLED is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePair {
    pub input: String,
    pub output: String,
}

/// Problem statement facts pulled from the problem page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemMetadata {
    pub title: String,
    pub constraints: String,
    #[serde(default)]
    pub samples: Vec<SamplePair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCode {
    pub code: String,
    pub language: String,
}

impl SourceCode {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }
}

/// Stage input. Each stage copies what it received and adds its own
/// artifact before handing the payload to its successor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProblemMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<SourceCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<SourceCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<SourceCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_count: Option<u32>,
}

/// Per-unit bookkeeping for stages that can partially succeed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl Tally {
    pub fn record(&mut self, ok: bool) {
        self.total += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    Timeout,
    CompileError,
}

/// Outcome of running one program against one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub testcase_id: u32,
    pub actual_output: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: ExecutionStatus,
}

/// What a stage produced, recorded on its job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub tally: Tally,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_job_id: Option<String>,
    /// Input of the successor stage, kept so a lost successor can be rebuilt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_payload: Option<JobPayload>,
}

/// Durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub platform: String,
    pub problem_id: String,
    #[serde(default)]
    pub payload: JobPayload,
    #[serde(default)]
    pub owner_token: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub needs_review: bool,
    pub timeout_ms: u64,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        platform: impl Into<String>,
        problem_id: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Pending,
            platform: platform.into(),
            problem_id: problem_id.into(),
            payload,
            owner_token: None,
            claimed_at: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_message: None,
            needs_review: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Successor stage record inheriting this job's problem key and limits
    pub fn successor(&self, job_type: JobType, payload: JobPayload) -> Job {
        Job::new(job_type, self.platform.clone(), self.problem_id.clone(), payload)
            .with_max_attempts(self.max_attempts)
            .with_timeout_ms(self.timeout_ms)
    }

    /// The successor this COMPLETED job recorded, rebuilt under its
    /// reserved id
    pub fn recorded_successor(&self) -> Option<Job> {
        if self.status != JobStatus::Completed {
            return None;
        }
        let outcome = self.outcome.as_ref()?;
        let next_type = self.job_type.next_stage()?;
        let mut next = self.successor(next_type, outcome.next_payload.clone()?);
        next.job_id = outcome.next_job_id.clone()?;
        Some(next)
    }

    /// PROCESSING and claimed before `now - processing_timeout`
    pub fn is_orphaned(&self, now: DateTime<Utc>, processing_timeout: Duration) -> bool {
        self.status == JobStatus::Processing
            && self
                .claimed_at
                .map(|claimed| claimed < now - processing_timeout)
                .unwrap_or(true)
    }

    pub fn retries_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Test case belonging to a (platform, problem_id) pair.
/// `expected_output` stays empty until output generation fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub testcase_id: u32,
    pub input: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TestCase {
    pub fn new(testcase_id: u32, input: impl Into<String>) -> Self {
        Self {
            testcase_id,
            input: input.into(),
            expected_output: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_expected(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = Some(expected_output.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_serialization() {
        let json = serde_json::to_string(&JobType::GenerateTestCases).unwrap();
        assert_eq!(json, "\"GENERATE_TEST_CASES\"");

        let parsed: JobType = serde_json::from_str("\"EXECUTE_SUBMISSION\"").unwrap();
        assert_eq!(parsed, JobType::ExecuteSubmission);
    }

    #[test]
    fn test_job_type_from_str() {
        assert_eq!(
            JobType::from_str("extract-metadata"),
            Some(JobType::ExtractMetadata)
        );
        assert_eq!(
            JobType::from_str("GENERATE_OUTPUTS"),
            Some(JobType::GenerateOutputs)
        );
        assert_eq!(JobType::from_str("compile"), None);
    }

    #[test]
    fn test_stage_chain_ends_at_outputs() {
        let mut stage = JobType::ExtractMetadata;
        let mut chain = vec![stage];
        while let Some(next) = stage.next_stage() {
            chain.push(next);
            stage = next;
        }
        assert_eq!(
            chain,
            vec![
                JobType::ExtractMetadata,
                JobType::GenerateSolution,
                JobType::GenerateTestGenerator,
                JobType::GenerateTestCases,
                JobType::GenerateOutputs,
            ]
        );
        assert_eq!(JobType::ExecuteSubmission.next_stage(), None);
    }

    #[test]
    fn test_submission_has_its_own_queue() {
        assert_eq!(JobType::ExecuteSubmission.queue(), QueueKind::Submission);
        for job_type in JobType::all_variants() {
            if *job_type != JobType::ExecuteSubmission {
                assert_ne!(job_type.queue(), QueueKind::Submission);
            }
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_orphan_detection() {
        let now = Utc::now();
        let mut job = Job::new(JobType::GenerateOutputs, "codeforces", "1A", JobPayload::default());
        assert!(!job.is_orphaned(now, Duration::seconds(60)));

        job.status = JobStatus::Processing;
        job.claimed_at = Some(now - Duration::seconds(30));
        assert!(!job.is_orphaned(now, Duration::seconds(60)));

        job.claimed_at = Some(now - Duration::seconds(90));
        assert!(job.is_orphaned(now, Duration::seconds(60)));
    }

    #[test]
    fn test_tally() {
        let mut tally = Tally::default();
        tally.record(true);
        tally.record(false);
        tally.record(true);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.failed, 1);
        assert!(!tally.all_succeeded());
    }

    #[test]
    fn test_job_roundtrip_keeps_payload() {
        let payload = JobPayload {
            submission: Some(SourceCode::new("print(1)", "python")),
            ..Default::default()
        };
        let job = Job::new(JobType::ExecuteSubmission, "atcoder", "abc300_a", payload);
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert!(!json.contains("problem_url"));
    }
}
