// End-to-end orchestrator scenarios over the in-memory store and queue and
// the process sandbox, with a scripted LLM collaborator.
use crate::engine::tests::test_sandbox;
use crate::events::tests::RecordingObserver;
use crate::events::PipelineEvent;
use crate::llm::{CollaboratorError, FailedCase, HintGenerator, SolutionGenerator};
use crate::pipeline::{Orchestrator, ProcessOutcome, RetryPolicy};
use crate::stages::{self, StageDeps, StageSettings};
use crate::sweeper::Sweeper;
use crate::worker::owner_token;
use async_trait::async_trait;
use caseforge_common::queue::MemoryQueue;
use caseforge_common::store::{KvStore, MemoryStore, SharedStore, StoreError};
use caseforge_common::types::{
    ExecutionStatus, Job, JobPayload, JobStatus, JobType, ProblemMetadata, QueueKind, SamplePair,
    SourceCode, TestCase,
};
use caseforge_common::{JobRepository, QueueMessage, QueueTransport, TestCaseRepository};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SUM: &str = "read a b\necho $((a + b))\n";

#[derive(Default)]
struct ScriptedLlm {
    metadata: Option<ProblemMetadata>,
    solution: Option<SourceCode>,
    generator: Option<SourceCode>,
    /// Unscripted calls fail like a 503 instead of a rejection
    outage: bool,
    hints_down: bool,
    hint_requests: Mutex<Vec<Vec<FailedCase>>>,
}

impl ScriptedLlm {
    fn reply<T: Clone>(&self, scripted: &Option<T>) -> Result<T, CollaboratorError> {
        match scripted {
            Some(value) => Ok(value.clone()),
            None if self.outage => Err(CollaboratorError::Http("503 Service Unavailable".into())),
            None => Err(CollaboratorError::Rejected("not scripted".into())),
        }
    }
}

#[async_trait]
impl SolutionGenerator for ScriptedLlm {
    async fn extract_metadata(&self, _url: &str) -> Result<ProblemMetadata, CollaboratorError> {
        self.reply(&self.metadata)
    }

    async fn generate_solution(&self, _: &ProblemMetadata) -> Result<SourceCode, CollaboratorError> {
        self.reply(&self.solution)
    }

    async fn generate_test_generator(
        &self,
        _: &ProblemMetadata,
        _: &SourceCode,
    ) -> Result<SourceCode, CollaboratorError> {
        self.reply(&self.generator)
    }
}

#[async_trait]
impl HintGenerator for ScriptedLlm {
    async fn generate_hints(&self, failed: &[FailedCase]) -> Result<Vec<String>, CollaboratorError> {
        self.hint_requests.lock().unwrap().push(failed.to_vec());
        if self.hints_down {
            return Err(CollaboratorError::Timeout);
        }
        Ok(vec![format!("{} case(s) failed, check overflow", failed.len())])
    }
}

/// Memory store whose record creation can be made to fail like a dropped
/// connection
struct FlakyStore {
    inner: SharedStore,
    fail_creates: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::shared(),
            fail_creates: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset by peer".into()));
        }
        self.inner.put_if_absent(key, value).await
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        self.inner.conditional_update(key, expected, new_value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.inner.scan_prefix(prefix).await
    }
}

struct Harness {
    jobs: JobRepository,
    testcases: TestCaseRepository,
    queue: Arc<MemoryQueue>,
    orchestrator: Orchestrator,
    observer: Arc<RecordingObserver>,
    llm: Arc<ScriptedLlm>,
}

impl Harness {
    fn new(llm: ScriptedLlm) -> Self {
        Self::with_store(llm, MemoryStore::shared())
    }

    fn with_store(llm: ScriptedLlm, store: SharedStore) -> Self {
        let queue = MemoryQueue::shared();
        let llm = Arc::new(llm);
        let observer = Arc::new(RecordingObserver::default());
        let testcases = TestCaseRepository::new(store.clone());

        let deps = StageDeps {
            sandbox: test_sandbox(),
            testcases: testcases.clone(),
            author: llm.clone(),
            hints: llm.clone(),
            settings: StageSettings {
                llm_timeout: Duration::from_secs(5),
                hint_case_limit: 2,
                generated_case_count: 5,
            },
        };
        let orchestrator = Orchestrator::new(
            JobRepository::new(store.clone()),
            queue.clone(),
            stages::registry(deps),
            RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
        )
        .with_observer(observer.clone());

        Self {
            jobs: JobRepository::new(store),
            testcases,
            queue,
            orchestrator,
            observer,
            llm,
        }
    }

    async fn submit(&self, job: &Job) {
        self.jobs.create(job).await.unwrap();
        self.queue.publish(&QueueMessage::for_job(job)).await.unwrap();
    }

    async fn next_message(&self, kind: QueueKind) -> QueueMessage {
        self.queue
            .receive(kind, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no message on {}", kind))
    }

    async fn run_next(&self, kind: QueueKind) -> ProcessOutcome {
        let message = self.next_message(kind).await;
        self.orchestrator
            .process(&message, &owner_token("test-node"))
            .await
            .unwrap()
    }

    async fn seed_cases(&self, cases: &[TestCase]) {
        self.testcases
            .replace_all("codeforces", "1A", cases)
            .await
            .unwrap();
    }
}

fn sh(code: &str) -> SourceCode {
    SourceCode::new(code, "sh")
}

fn submission_job(code: &str) -> Job {
    Job::new(
        JobType::ExecuteSubmission,
        "codeforces",
        "1A",
        JobPayload {
            submission: Some(sh(code)),
            ..Default::default()
        },
    )
}

fn completed(outcome: ProcessOutcome) -> Job {
    match outcome {
        ProcessOutcome::Completed(job) => job,
        other => panic!("expected completion, got {:?}", other),
    }
}

fn failed(outcome: ProcessOutcome) -> Job {
    match outcome {
        ProcessOutcome::Failed(job) => job,
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_outputs_then_submission_with_reference_solution() {
    let h = Harness::new(ScriptedLlm::default());
    h.seed_cases(&[
        TestCase::new(1, "1 2\n").with_expected("3\n"),
        TestCase::new(2, "5 7\n").with_expected("12\n"),
        TestCase::new(3, "10 20\n"),
    ])
    .await;

    let outputs = Job::new(
        JobType::GenerateOutputs,
        "codeforces",
        "1A",
        JobPayload {
            solution: Some(sh(SUM)),
            ..Default::default()
        },
    );
    h.submit(&outputs).await;
    let done = completed(h.run_next(QueueKind::Generation).await);
    assert_eq!(done.status, JobStatus::Completed);
    assert!(!done.needs_review);
    assert!(done.outcome.as_ref().unwrap().next_job_id.is_none());

    let cases = h.testcases.list("codeforces", "1A").await.unwrap();
    assert_eq!(cases.len(), 3);
    assert_eq!(cases[2].expected_output.as_deref(), Some("30\n"));

    h.submit(&submission_job(SUM)).await;
    let judged = completed(h.run_next(QueueKind::Submission).await);
    assert!(!judged.needs_review);
    let outcome = judged.outcome.unwrap();
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results.iter().all(|r| r.passed));
    assert!(outcome.hints.is_empty());
    assert!(h.llm.hint_requests.lock().unwrap().is_empty());

    let events = h.observer.take();
    assert!(events.contains(&PipelineEvent::TestCasesChanged {
        platform: "codeforces".into(),
        problem_id: "1A".into(),
        count: 3,
    }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::JobCompleted { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_runtime_error_is_isolated_to_its_case() {
    let h = Harness::new(ScriptedLlm::default());
    let cases: Vec<TestCase> = (1..=5)
        .map(|n| TestCase::new(n, format!("{}\n", n)).with_expected(format!("{}\n", n * 2)))
        .collect();
    h.seed_cases(&cases).await;

    h.submit(&submission_job(
        "read n\nif [ \"$n\" = 3 ]; then echo boom >&2; exit 1; fi\necho $((n * 2))\n",
    ))
    .await;
    let job = completed(h.run_next(QueueKind::Submission).await);
    assert!(job.needs_review);

    let outcome = job.outcome.unwrap();
    assert_eq!(outcome.tally.total, 5);
    assert_eq!(outcome.tally.failed, 1);
    for result in &outcome.results {
        if result.testcase_id == 3 {
            assert!(!result.passed);
            assert_eq!(result.status, ExecutionStatus::RuntimeError);
            assert!(result.error.as_deref().unwrap().contains("boom"));
        } else {
            assert!(result.passed, "case {} should pass", result.testcase_id);
        }
    }

    let requests = h.llm.hint_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 1);
    assert_eq!(requests[0][0].testcase_id, 3);
    assert_eq!(outcome.hints, vec!["1 case(s) failed, check overflow".to_string()]);
}

#[tokio::test]
async fn test_hint_outage_does_not_fail_submission() {
    let h = Harness::new(ScriptedLlm {
        hints_down: true,
        ..Default::default()
    });
    h.seed_cases(&[
        TestCase::new(1, "1 2\n").with_expected("3\n"),
        TestCase::new(2, "5 7\n").with_expected("12\n"),
        TestCase::new(3, "2 2\n").with_expected("4\n"),
    ])
    .await;

    h.submit(&submission_job("read a b\necho $((a * b))\n")).await;
    let job = completed(h.run_next(QueueKind::Submission).await);
    assert!(job.needs_review);
    let outcome = job.outcome.unwrap();
    assert_eq!(outcome.tally.succeeded, 1);
    assert!(outcome.hints.is_empty());

    // Only the first two failures are summarized
    let requests = h.llm.hint_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 2);
}

#[tokio::test]
async fn test_duplicate_delivery_runs_once() {
    let h = Harness::new(ScriptedLlm::default());
    h.seed_cases(&[TestCase::new(1, "1 2\n").with_expected("3\n")]).await;

    let job = submission_job(SUM);
    h.submit(&job).await;
    h.queue.publish(&QueueMessage::for_job(&job)).await.unwrap();

    let first = h.next_message(QueueKind::Submission).await;
    let second = h.next_message(QueueKind::Submission).await;
    let (token_a, token_b) = (owner_token("node-a"), owner_token("node-b"));
    let (a, b) = tokio::join!(
        h.orchestrator.process(&first, &token_a),
        h.orchestrator.process(&second, &token_b),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| o.label());
    assert_eq!(outcomes[0].label(), "completed");
    assert_eq!(outcomes[1], ProcessOutcome::Conflict);
}

#[tokio::test]
async fn test_transient_failure_retries_then_exhausts() {
    let h = Harness::new(ScriptedLlm {
        outage: true,
        ..Default::default()
    });
    let job = Job::new(
        JobType::GenerateSolution,
        "codeforces",
        "1A",
        JobPayload {
            metadata: Some(ProblemMetadata {
                title: "A+B".into(),
                constraints: String::new(),
                samples: Vec::new(),
            }),
            ..Default::default()
        },
    )
    .with_max_attempts(2);
    h.submit(&job).await;

    for attempt in 1..=2 {
        match h.run_next(QueueKind::Ai).await {
            ProcessOutcome::Retrying(job) => {
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.attempt_count, attempt);
                assert!(job.owner_token.is_none());
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert!(h.queue.pending(QueueKind::Ai).is_empty());
        assert_eq!(h.queue.delayed_len(), 1);
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(h.queue.promote_due(later).await.unwrap(), 1);
    }

    let job = failed(h.run_next(QueueKind::Ai).await);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("exceeded max attempts"));
    assert!(h
        .observer
        .take()
        .iter()
        .any(|e| matches!(e, PipelineEvent::JobFailed { .. })));
}

#[tokio::test]
async fn test_compile_error_fails_without_retry() {
    let h = Harness::new(ScriptedLlm::default());
    h.seed_cases(&[
        TestCase::new(1, "1 2\n").with_expected("3\n"),
        TestCase::new(2, "5 7\n").with_expected("12\n"),
    ])
    .await;

    h.submit(&submission_job("if then fi (\n")).await;
    let job = failed(h.run_next(QueueKind::Submission).await);
    assert!(job.error_message.as_deref().unwrap().starts_with("compile error"));
    assert_eq!(job.attempt_count, 0);
    assert_eq!(h.queue.delayed_len(), 0);

    let results = job.outcome.unwrap().results;
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.status == ExecutionStatus::CompileError && !r.passed));
}

#[tokio::test]
async fn test_unsupported_language_is_permanent() {
    let h = Harness::new(ScriptedLlm::default());
    h.seed_cases(&[TestCase::new(1, "1 2\n").with_expected("3\n")]).await;

    let mut job = submission_job(SUM);
    job.payload.submission = Some(SourceCode::new("print(3)", "brainfuck"));
    h.submit(&job).await;
    let job = failed(h.run_next(QueueKind::Submission).await);
    assert_eq!(job.error_message.as_deref(), Some("unsupported language: brainfuck"));
}

#[tokio::test]
async fn test_cancellation_mid_stage_discards_result() {
    let h = Harness::new(ScriptedLlm::default());
    let cases: Vec<TestCase> = (1..=4)
        .map(|n| TestCase::new(n, "x\n").with_expected("x\n"))
        .collect();
    h.seed_cases(&cases).await;

    let job = submission_job("sleep 0.4\ncat\n");
    h.submit(&job).await;
    let message = h.next_message(QueueKind::Submission).await;
    let token = owner_token("node-a");

    let (outcome, _) = tokio::join!(
        h.orchestrator.process(&message, &token),
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            h.jobs.cancel(&job.job_id, Utc::now()).await.unwrap();
        }
    );
    assert_eq!(outcome.unwrap(), ProcessOutcome::Cancelled);

    let current = h.jobs.require(&job.job_id).await.unwrap();
    assert_eq!(current.status, JobStatus::Cancelled);
    assert!(current.outcome.is_none());
    assert!(h.observer.take().is_empty());
}

#[tokio::test]
async fn test_malformed_url_fails_extraction() {
    let h = Harness::new(ScriptedLlm::default());
    let job = Job::new(
        JobType::ExtractMetadata,
        "codeforces",
        "1A",
        JobPayload {
            problem_url: Some("https://example.com/problems/1".into()),
            ..Default::default()
        },
    );
    h.submit(&job).await;
    let job = failed(h.run_next(QueueKind::Ai).await);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("malformed problem URL"));
    assert!(h.queue.pending(QueueKind::Ai).is_empty());
}

#[tokio::test]
async fn test_full_chain_from_url_to_verified_cases() {
    let h = Harness::new(ScriptedLlm {
        metadata: Some(ProblemMetadata {
            title: "A+B".into(),
            constraints: "0 <= a, b <= 1000".into(),
            samples: vec![
                SamplePair {
                    input: "1 2".into(),
                    output: "3".into(),
                },
                SamplePair {
                    input: "5 7".into(),
                    output: "12".into(),
                },
            ],
        }),
        solution: Some(sh(SUM)),
        generator: Some(sh("read i\necho \"$i $((i * 10))\"\n")),
        ..Default::default()
    });

    let first = Job::new(
        JobType::ExtractMetadata,
        "codeforces",
        "1A",
        JobPayload {
            problem_url: Some("https://codeforces.com/problemset/problem/1/A".into()),
            ..Default::default()
        },
    );
    h.submit(&first).await;

    let stages = [
        (QueueKind::Ai, JobType::ExtractMetadata),
        (QueueKind::Ai, JobType::GenerateSolution),
        (QueueKind::Ai, JobType::GenerateTestGenerator),
        (QueueKind::Generation, JobType::GenerateTestCases),
        (QueueKind::Generation, JobType::GenerateOutputs),
    ];
    let mut expected_id = first.job_id.clone();
    for (kind, job_type) in stages {
        let job = completed(h.run_next(kind).await);
        assert_eq!(job.job_type, job_type);
        assert_eq!(job.job_id, expected_id);
        assert!(!job.needs_review, "{} flagged for review", job_type);
        match job.outcome.unwrap().next_job_id {
            Some(next) => expected_id = next,
            None => assert_eq!(job_type, JobType::GenerateOutputs),
        }
    }
    assert!(h.queue.pending(QueueKind::Ai).is_empty());
    assert!(h.queue.pending(QueueKind::Generation).is_empty());

    let cases = h.testcases.list("codeforces", "1A").await.unwrap();
    assert_eq!(cases.len(), 7);
    assert_eq!(cases[0].expected_output.as_deref(), Some("3"));
    assert_eq!(cases[2].input, "1 10\n");
    assert_eq!(cases[2].expected_output.as_deref(), Some("11\n"));
    assert!(cases.iter().all(|c| c.expected_output.is_some()));
}

#[tokio::test]
async fn test_validation_rule_matches_between_outputs_and_judging() {
    let h = Harness::new(ScriptedLlm::default());
    h.seed_cases(&[
        TestCase::new(1, "1 2\n").with_expected("3"),
        TestCase::new(2, "5 7\n").with_expected("12\n"),
    ])
    .await;
    // Trailing spaces on the line and trailing blank lines only
    let padded = "read a b\nprintf '%s  \\n\\n' $((a + b))\n";

    let outputs = Job::new(
        JobType::GenerateOutputs,
        "codeforces",
        "1A",
        JobPayload {
            solution: Some(sh(padded)),
            ..Default::default()
        },
    );
    h.submit(&outputs).await;
    let done = completed(h.run_next(QueueKind::Generation).await);
    assert!(!done.needs_review);
    assert_eq!(done.outcome.unwrap().tally.failed, 0);
    let cases = h.testcases.list("codeforces", "1A").await.unwrap();
    assert_eq!(cases[0].expected_output.as_deref(), Some("3"));

    h.submit(&submission_job(padded)).await;
    let judged = completed(h.run_next(QueueKind::Submission).await);
    assert!(!judged.needs_review);
    let outcome = judged.outcome.unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results.iter().all(|r| r.passed));
    assert_eq!(outcome.results[0].actual_output, "3  \n\n");
}

#[tokio::test]
async fn test_successor_lost_to_store_error_is_restored() {
    let store = Arc::new(FlakyStore::new());
    let h = Harness::with_store(
        ScriptedLlm {
            metadata: Some(ProblemMetadata {
                title: "A+B".into(),
                constraints: String::new(),
                samples: vec![SamplePair {
                    input: "1 2".into(),
                    output: "3".into(),
                }],
            }),
            solution: Some(sh(SUM)),
            ..Default::default()
        },
        store.clone(),
    );
    let first = Job::new(
        JobType::ExtractMetadata,
        "codeforces",
        "1A",
        JobPayload {
            problem_url: Some("https://codeforces.com/problemset/problem/1/A".into()),
            ..Default::default()
        },
    );
    h.submit(&first).await;

    store.fail_creates.store(true, Ordering::SeqCst);
    let done = completed(h.run_next(QueueKind::Ai).await);
    store.fail_creates.store(false, Ordering::SeqCst);

    let next_id = done.outcome.unwrap().next_job_id.unwrap();
    assert!(h.jobs.get(&next_id).await.unwrap().is_none());
    assert!(h.queue.pending(QueueKind::Ai).is_empty());

    let sweeper = Sweeper::new(h.jobs.clone(), h.queue.clone(), Duration::from_secs(60)).unwrap();
    let report = sweeper
        .sweep_once(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.restored, 1);

    let solved = completed(h.run_next(QueueKind::Ai).await);
    assert_eq!(solved.job_id, next_id);
    assert_eq!(solved.job_type, JobType::GenerateSolution);
}
