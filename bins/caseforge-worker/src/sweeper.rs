/// Orphan Recovery Sweeper
///
/// Runs on its own schedule, independent of message delivery:
/// - orphaned PROCESSING jobs are reclaimed (PENDING + re-published, or
///   FAILED once attempts are used up)
/// - PENDING jobs untouched for a whole processing timeout get their
///   message re-published, covering a publish lost between create and send
/// - COMPLETED jobs whose recorded successor was never created get it
///   created and published
/// - due retry messages are promoted on a shorter tick
///
/// Every write is conditional, so several sweepers may run at once. A job
/// that cannot be handled is logged and skipped; the rest of the scan goes on.

use crate::events::{self, EventObserver, PipelineEvent};
use crate::metrics;
use caseforge_common::types::{Job, JobStatus};
use caseforge_common::{JobRepository, QueueMessage, ReclaimOutcome, SharedQueue, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub exhausted: usize,
    pub republished: usize,
    /// Successors created on behalf of a completed predecessor
    pub restored: usize,
    pub errors: usize,
}

pub struct Sweeper {
    jobs: JobRepository,
    queue: SharedQueue,
    processing_timeout: chrono::Duration,
    observers: Vec<Arc<dyn EventObserver>>,
}

impl Sweeper {
    pub fn new(
        jobs: JobRepository,
        queue: SharedQueue,
        processing_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            jobs,
            queue,
            processing_timeout: chrono::Duration::from_std(processing_timeout)?,
            observers: Vec::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Only listing the store can fail the whole sweep
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        for job in self.jobs.list().await? {
            if let Err(e) = self.sweep_job(&job, now, &mut report).await {
                report.errors += 1;
                warn!(job_id = %job.job_id, status = %job.status, error = %e, "Sweep of job failed");
            }
        }

        Ok(report)
    }

    async fn sweep_job(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let stale_before = now - self.processing_timeout;

        match job.status {
            JobStatus::Processing if job.is_orphaned(now, self.processing_timeout) => {
                match self.jobs.reclaim(&job.job_id, self.processing_timeout, now).await? {
                    ReclaimOutcome::Requeued(job) => {
                        metrics::record_reclaim("requeued");
                        warn!(
                            job_id = %job.job_id,
                            job_type = %job.job_type,
                            attempt = job.attempt_count,
                            "Reclaimed orphaned job"
                        );
                        report.requeued += 1;
                        self.queue.publish(&QueueMessage::for_job(&job)).await?;
                    }
                    ReclaimOutcome::Exhausted(job) => {
                        metrics::record_reclaim("exhausted");
                        error!(
                            job_id = %job.job_id,
                            job_type = %job.job_type,
                            attempts = job.attempt_count,
                            "Orphaned job exceeded max attempts"
                        );
                        report.exhausted += 1;
                        events::notify(&self.observers, &PipelineEvent::failed(&job)).await;
                    }
                    ReclaimOutcome::Skipped => {
                        metrics::record_reclaim("skipped");
                        debug!(job_id = %job.job_id, "Orphan already reclaimed elsewhere");
                    }
                }
            }
            JobStatus::Pending if job.updated_at < stale_before => {
                if let Some(job) = self
                    .jobs
                    .touch_stale_pending(&job.job_id, stale_before, now)
                    .await?
                {
                    self.queue.publish(&QueueMessage::for_job(&job)).await?;
                    info!(job_id = %job.job_id, job_type = %job.job_type, "Re-published stale pending job");
                    report.republished += 1;
                }
            }
            // Give the completing worker a whole timeout to chain it itself
            JobStatus::Completed if job.updated_at < stale_before => {
                if let Some(next) = self.jobs.ensure_successor(job).await? {
                    warn!(
                        job_id = %job.job_id,
                        next_job_id = %next.job_id,
                        next_job_type = %next.job_type,
                        "Restored missing successor"
                    );
                    report.restored += 1;
                    self.queue.publish(&QueueMessage::for_job(&next)).await?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub async fn run(
        self,
        sweep_interval: Duration,
        promote_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            sweep_secs = sweep_interval.as_secs(),
            timeout_secs = self.processing_timeout.num_seconds(),
            "Sweeper started"
        );
        let mut sweep_tick = tokio::time::interval(sweep_interval);
        let mut promote_tick = tokio::time::interval(promote_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        promote_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = promote_tick.tick() => {
                    match self.queue.promote_due(Utc::now()).await {
                        Ok(0) => {}
                        Ok(moved) => debug!(moved = moved, "Promoted due retries"),
                        Err(e) => warn!(error = %e, "Failed to promote delayed messages"),
                    }
                }
                _ = sweep_tick.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => info!(
                            requeued = report.requeued,
                            exhausted = report.exhausted,
                            republished = report.republished,
                            restored = report.restored,
                            errors = report.errors,
                            "Sweep finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Sweeper stopped");
    }
}
