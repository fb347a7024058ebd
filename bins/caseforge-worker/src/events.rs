//! Pipeline events
//!
//! The orchestrator reports what it did to a list of observers instead of
//! other components reaching into the store; cache invalidation and
//! notifications hang off these.

use async_trait::async_trait;
use caseforge_common::redis::EVENTS_CHANNEL;
use caseforge_common::types::{Job, JobType};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on a single observer callback
const OBSERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobCompleted {
        job_id: String,
        job_type: JobType,
        platform: String,
        problem_id: String,
        needs_review: bool,
        next_job_id: Option<String>,
    },
    JobFailed {
        job_id: String,
        job_type: JobType,
        platform: String,
        problem_id: String,
        error: String,
    },
    /// The problem's test set was replaced
    TestCasesChanged {
        platform: String,
        problem_id: String,
        count: usize,
    },
}

impl PipelineEvent {
    pub fn completed(job: &Job) -> Self {
        PipelineEvent::JobCompleted {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            platform: job.platform.clone(),
            problem_id: job.problem_id.clone(),
            needs_review: job.needs_review,
            next_job_id: job.outcome.as_ref().and_then(|o| o.next_job_id.clone()),
        }
    }

    pub fn failed(job: &Job) -> Self {
        PipelineEvent::JobFailed {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            platform: job.platform.clone(),
            problem_id: job.problem_id.clone(),
            error: job.error_message.clone().unwrap_or_default(),
        }
    }
}

/// Observers must not fail the job; delivery is best-effort
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &PipelineEvent);
}

/// Hand `event` to every observer in turn; a slow observer is cut off
pub async fn notify(observers: &[Arc<dyn EventObserver>], event: &PipelineEvent) {
    for observer in observers {
        if tokio::time::timeout(OBSERVER_TIMEOUT, observer.on_event(event))
            .await
            .is_err()
        {
            warn!("Event observer timed out");
        }
    }
}

pub struct TracingObserver;

#[async_trait]
impl EventObserver for TracingObserver {
    async fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::JobCompleted {
                job_id,
                job_type,
                needs_review,
                next_job_id,
                ..
            } => info!(
                job_id = %job_id,
                job_type = %job_type,
                needs_review = needs_review,
                next_job_id = next_job_id.as_deref().unwrap_or("-"),
                "Job completed"
            ),
            PipelineEvent::JobFailed {
                job_id,
                job_type,
                error,
                ..
            } => warn!(job_id = %job_id, job_type = %job_type, error = %error, "Job failed"),
            PipelineEvent::TestCasesChanged {
                platform,
                problem_id,
                count,
            } => info!(
                platform = %platform,
                problem_id = %problem_id,
                count = count,
                "Test cases replaced"
            ),
        }
    }
}

/// Publishes events as JSON on the `caseforge:events` channel
pub struct RedisEventPublisher {
    conn: ConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventObserver for RedisEventPublisher {
    async fn on_event(&self, event: &PipelineEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode pipeline event");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, i64>(EVENTS_CHANNEL, payload).await {
            warn!(error = %e, "Failed to publish pipeline event");
        }
    }
}
