/// Pipeline Orchestrator
///
/// **Responsibility:**
/// Take one delivered queue message through claim -> stage handler ->
/// release, then chain the successor stage and tell the observers.
///
/// **Architecture:**
/// 1. Handlers are registered per job type in a `HandlerRegistry`
/// 2. A handler only computes; every job-record write happens here through
///    the conditional-write primitives of `JobRepository`
/// 3. A successor job is created only after its predecessor is COMPLETED
///
/// Duplicate deliveries lose the claim and are dropped quietly.

use crate::error::StageError;
use crate::evaluator;
use crate::events::{self, EventObserver, PipelineEvent};
use crate::metrics;
use anyhow::Context;
use async_trait::async_trait;
use caseforge_common::types::{Job, JobOutcome, JobPayload, JobStatus, JobType, Tally};
use caseforge_common::{
    ClaimOutcome, JobRepository, QueueMessage, Release, SharedQueue, StoreError,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a stage handler hands back on success
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub outcome: JobOutcome,
    pub needs_review: bool,
    /// Payload for the successor stage; None ends the chain
    pub next: Option<JobPayload>,
    /// Size of the test set the stage wrote, if it replaced one
    pub testcases_replaced: Option<usize>,
}

impl StageOutput {
    pub fn new(tally: Tally) -> Self {
        Self {
            outcome: JobOutcome {
                tally,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Raise `needs_review` when any unit failed
    pub fn reviewed(mut self) -> Self {
        self.needs_review = !self.outcome.tally.all_succeeded();
        self
    }

    pub fn then(mut self, payload: JobPayload) -> Self {
        self.next = Some(payload);
        self
    }

    pub fn with_testcases(mut self, count: usize) -> Self {
        self.testcases_replaced = Some(count);
        self
    }
}

/// Claimed job plus the means to check it is still ours
pub struct JobContext {
    pub job: Job,
    pub owner_token: String,
    jobs: JobRepository,
}

impl JobContext {
    pub fn new(job: Job, owner_token: impl Into<String>, jobs: JobRepository) -> Self {
        Self {
            job,
            owner_token: owner_token.into(),
            jobs,
        }
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    /// Per-run wall-clock limit
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.job.timeout_ms)
    }

    /// Checked before every expensive unit of work
    pub async fn ensure_active(&self) -> Result<(), StageError> {
        match self.jobs.get(&self.job.job_id).await? {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.owner_token.as_deref() == Some(self.owner_token.as_str()) =>
            {
                Ok(())
            }
            Some(job) if job.status == JobStatus::Cancelled => Err(StageError::Cancelled),
            _ => Err(StageError::LostOwnership),
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError>;
}

/// Typed dispatch table: job type -> handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn handles(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }
}

/// Exponential backoff for transient failures: `base * 2^(attempt-1)`, capped
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// How processing one message ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed(Job),
    Failed(Job),
    /// Back to PENDING, message scheduled after backoff
    Retrying(Job),
    /// Duplicate delivery or job not PENDING any more
    Conflict,
    Cancelled,
    LostOwnership,
    /// No handler or unknown job; message dropped
    Dropped,
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed(_) => "completed",
            ProcessOutcome::Failed(_) => "failed",
            ProcessOutcome::Retrying(_) => "retrying",
            ProcessOutcome::Conflict => "conflict",
            ProcessOutcome::Cancelled => "cancelled",
            ProcessOutcome::LostOwnership => "lost_ownership",
            ProcessOutcome::Dropped => "dropped",
        }
    }
}

pub struct Orchestrator {
    jobs: JobRepository,
    queue: SharedQueue,
    registry: HandlerRegistry,
    retry: RetryPolicy,
    observers: Vec<Arc<dyn EventObserver>>,
}

impl Orchestrator {
    pub fn new(
        jobs: JobRepository,
        queue: SharedQueue,
        registry: HandlerRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            queue,
            registry,
            retry,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[tracing::instrument(
        skip(self, message),
        fields(job_id = %message.job_id, job_type = %message.job_type, owner = %owner_token)
    )]
    pub async fn process(
        &self,
        message: &QueueMessage,
        owner_token: &str,
    ) -> anyhow::Result<ProcessOutcome> {
        if !self.registry.handles(message.job_type) {
            warn!("No handler registered for job type, dropping message");
            return Ok(ProcessOutcome::Dropped);
        }

        let job = match self.jobs.claim(&message.job_id, owner_token, Utc::now()).await {
            Ok(ClaimOutcome::Claimed(job)) => job,
            Ok(ClaimOutcome::Conflict(current)) => {
                debug!(status = %current.status, "Claim conflict, dropping duplicate delivery");
                metrics::record_claim_conflict(message.job_type);
                return Ok(ProcessOutcome::Conflict);
            }
            Err(StoreError::NotFound(_)) => {
                warn!("Message refers to an unknown job, dropping");
                return Ok(ProcessOutcome::Dropped);
            }
            Err(e) => return Err(e).context("failed to claim job"),
        };

        info!(attempt = job.attempt_count, "Claimed job");
        let job_type = job.job_type;
        let ctx = JobContext::new(job, owner_token, self.jobs.clone());
        let started = Instant::now();

        let result = match self.registry.get(job_type) {
            Some(handler) => handler.handle(&ctx).await,
            None => Err(StageError::Permanent(format!(
                "no handler registered for {}",
                job_type
            ))),
        };

        let outcome = self.settle(&ctx, result).await?;
        metrics::record_stage(
            job_type,
            outcome.label(),
            started.elapsed().as_millis() as f64,
        );
        Ok(outcome)
    }

    /// Turn the handler result into exactly one conditional release
    async fn settle(
        &self,
        ctx: &JobContext,
        result: Result<StageOutput, StageError>,
    ) -> anyhow::Result<ProcessOutcome> {
        match result {
            Ok(output) => self.complete(ctx, output).await,
            Err(StageError::Transient(error)) => self.retry(ctx, error).await,
            Err(StageError::Permanent(error)) => self.fail(ctx, error, None).await,
            Err(StageError::Compile { message, results }) => {
                let outcome = (!results.is_empty()).then(|| JobOutcome {
                    tally: evaluator::tally(&results),
                    results,
                    ..Default::default()
                });
                self.fail(ctx, format!("compile error: {}", message), outcome)
                    .await
            }
            Err(StageError::Cancelled) => {
                info!("Job cancelled mid-stage, result discarded");
                Ok(ProcessOutcome::Cancelled)
            }
            Err(StageError::LostOwnership) => self.discarded(ctx).await,
        }
    }

    async fn complete(
        &self,
        ctx: &JobContext,
        output: StageOutput,
    ) -> anyhow::Result<ProcessOutcome> {
        let job = &ctx.job;
        let mut outcome = output.outcome;
        if let (Some(payload), Some(next_type)) = (output.next, job.job_type.next_stage()) {
            let next = job.successor(next_type, payload);
            outcome.next_job_id = Some(next.job_id);
            outcome.next_payload = Some(next.payload);
        }

        let released = self
            .jobs
            .release(
                &job.job_id,
                &ctx.owner_token,
                Release::Completed {
                    needs_review: output.needs_review,
                    outcome,
                },
                Utc::now(),
            )
            .await
            .context("failed to release completed job")?;

        let Some(done) = released else {
            return self.discarded(ctx).await;
        };

        self.chain(&done).await;

        if let Some(count) = output.testcases_replaced {
            self.emit(PipelineEvent::TestCasesChanged {
                platform: done.platform.clone(),
                problem_id: done.problem_id.clone(),
                count,
            })
            .await;
        }
        self.emit(PipelineEvent::completed(&done)).await;
        Ok(ProcessOutcome::Completed(done))
    }

    async fn retry(&self, ctx: &JobContext, error: String) -> anyhow::Result<ProcessOutcome> {
        warn!(attempt = ctx.job.attempt_count, error = %error, "Transient failure");
        let now = Utc::now();
        let released = self
            .jobs
            .release(&ctx.job.job_id, &ctx.owner_token, Release::Retry { error }, now)
            .await
            .context("failed to release job for retry")?;

        match released {
            Some(job) if job.status == JobStatus::Pending => {
                let delay = self.retry.backoff(job.attempt_count);
                let ready_at = now + chrono::Duration::from_std(delay)?;
                self.queue
                    .publish_at(&QueueMessage::for_job(&job), ready_at)
                    .await
                    .context("failed to schedule retry")?;
                info!(
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                Ok(ProcessOutcome::Retrying(job))
            }
            Some(job) => {
                error!(error = job.error_message.as_deref().unwrap_or(""), "Retries exhausted");
                self.emit(PipelineEvent::failed(&job)).await;
                Ok(ProcessOutcome::Failed(job))
            }
            None => self.discarded(ctx).await,
        }
    }

    async fn fail(
        &self,
        ctx: &JobContext,
        error: String,
        outcome: Option<JobOutcome>,
    ) -> anyhow::Result<ProcessOutcome> {
        error!(error = %error, "Stage failed permanently");
        let released = self
            .jobs
            .release(
                &ctx.job.job_id,
                &ctx.owner_token,
                Release::Failed { error, outcome },
                Utc::now(),
            )
            .await
            .context("failed to release failed job")?;

        match released {
            Some(job) => {
                self.emit(PipelineEvent::failed(&job)).await;
                Ok(ProcessOutcome::Failed(job))
            }
            None => self.discarded(ctx).await,
        }
    }

    /// Create and announce the successor recorded on `done`. The COMPLETED
    /// release already stands, so failures here are left to the sweeper.
    async fn chain(&self, done: &Job) {
        let next = match self.jobs.ensure_successor(done).await {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to create successor, left for the sweeper");
                return;
            }
        };
        match self.queue.publish(&QueueMessage::for_job(&next)).await {
            Ok(()) => info!(
                next_job_id = %next.job_id,
                next_job_type = %next.job_type,
                "Enqueued next stage"
            ),
            Err(e) => warn!(
                next_job_id = %next.job_id,
                error = %e,
                "Failed to publish successor, left for the sweeper"
            ),
        }
    }

    /// The release did not apply: either cancelled or reclaimed meanwhile
    async fn discarded(&self, ctx: &JobContext) -> anyhow::Result<ProcessOutcome> {
        let current = self.jobs.get(&ctx.job.job_id).await?;
        if current.map(|j| j.status) == Some(JobStatus::Cancelled) {
            info!("Job was cancelled, result discarded");
            Ok(ProcessOutcome::Cancelled)
        } else {
            warn!("Ownership lost before release, result discarded");
            Ok(ProcessOutcome::LostOwnership)
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        events::notify(&self.observers, &event).await;
    }
}
