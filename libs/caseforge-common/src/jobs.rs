//! Job store and claim protocol
//!
//! Every state transition is one conditional write against the record read
//! just before it. If another writer got in first the write fails with no
//! side effect and the transition is re-evaluated against the fresh record.

use crate::redis::{job_key, JOB_PREFIX};
use crate::store::{SharedStore, StoreError};
use crate::types::{Job, JobOutcome, JobStatus};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Bound on compare-and-set retries under contention
const MAX_CAS_ATTEMPTS: usize = 16;

pub const EXCEEDED_MAX_ATTEMPTS: &str = "exceeded max attempts";

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the job
    Claimed(Job),
    /// Someone else owns it or it is no longer PENDING; record unchanged
    Conflict(Job),
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            ClaimOutcome::Claimed(job) | ClaimOutcome::Conflict(job) => job,
        }
    }
}

/// Result a worker reports when giving a job back
#[derive(Debug, Clone)]
pub enum Release {
    Completed {
        needs_review: bool,
        outcome: JobOutcome,
    },
    Failed {
        error: String,
        outcome: Option<JobOutcome>,
    },
    /// Transient failure; back to PENDING if attempts remain
    Retry { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    /// Back to PENDING with one more attempt consumed; caller re-publishes
    Requeued(Job),
    /// Attempts used up; job is FAILED
    Exhausted(Job),
    /// Not orphaned (any more); nothing written
    Skipped,
}

enum Cas {
    Applied(Job),
    Rejected(Job),
}

fn decode(key: &str, raw: &str) -> Result<Job, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

fn encode(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|source| StoreError::Codec {
        key: job_key(&job.job_id),
        source,
    })
}

#[derive(Clone)]
pub struct JobRepository {
    store: SharedStore,
}

impl JobRepository {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let key = job_key(&job.job_id);
        if self.store.put_if_absent(&key, &encode(job)?).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(key))
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let key = job_key(job_id);
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn require(&self, job_id: &str) -> Result<Job, StoreError> {
        self.get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_key(job_id)))
    }

    /// Every decodable job record. Records that fail to decode are logged
    /// and skipped so one corrupt entry cannot hide the rest.
    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for (key, raw) in self.store.scan_prefix(JOB_PREFIX).await? {
            match decode(&key, &raw) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable job record"),
            }
        }
        Ok(jobs)
    }

    /// Create the successor recorded on a COMPLETED job if it does not
    /// exist yet. Returns it only when this call created it.
    pub async fn ensure_successor(&self, done: &Job) -> Result<Option<Job>, StoreError> {
        let Some(next) = done.recorded_successor() else {
            return Ok(None);
        };
        if self.get(&next.job_id).await?.is_some() {
            return Ok(None);
        }
        match self.create(&next).await {
            Ok(()) => Ok(Some(next)),
            Err(StoreError::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PROCESSING jobs whose claim is older than `processing_timeout`
    pub async fn list_orphaned(
        &self,
        now: DateTime<Utc>,
        processing_timeout: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| job.is_orphaned(now, processing_timeout))
            .collect())
    }

    /// Apply `transition` to the current record with a conditional write.
    /// `transition` returns None when its precondition does not hold.
    async fn update_where<F>(&self, job_id: &str, mut transition: F) -> Result<Cas, StoreError>
    where
        F: FnMut(&Job) -> Option<Job>,
    {
        let key = job_key(job_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let current = decode(&key, &raw)?;

            let Some(next) = transition(&current) else {
                return Ok(Cas::Rejected(current));
            };

            if self
                .store
                .conditional_update(&key, &raw, &encode(&next)?)
                .await?
            {
                return Ok(Cas::Applied(next));
            }
            debug!(job_id = %job_id, "Conditional write lost a race, re-reading");
        }
        Err(StoreError::Backend(format!(
            "gave up on {} after {} contended writes",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    /// PENDING -> PROCESSING under `owner_token`
    pub async fn claim(
        &self,
        job_id: &str,
        owner_token: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let cas = self
            .update_where(job_id, |job| {
                (job.status == JobStatus::Pending).then(|| Job {
                    status: JobStatus::Processing,
                    owner_token: Some(owner_token.to_string()),
                    claimed_at: Some(now),
                    updated_at: now,
                    ..job.clone()
                })
            })
            .await?;

        Ok(match cas {
            Cas::Applied(job) => ClaimOutcome::Claimed(job),
            Cas::Rejected(job) => ClaimOutcome::Conflict(job),
        })
    }

    /// Write the result of an attempt. Only applies while the job is still
    /// PROCESSING under `owner_token`; returns None when ownership was lost
    /// (reclaimed by the sweeper or cancelled) so a stale worker cannot
    /// clobber a newer attempt.
    pub async fn release(
        &self,
        job_id: &str,
        owner_token: &str,
        release: Release,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let cas = self
            .update_where(job_id, |job| {
                let owned = job.status == JobStatus::Processing
                    && job.owner_token.as_deref() == Some(owner_token);
                if !owned {
                    return None;
                }

                let released = Job {
                    owner_token: None,
                    updated_at: now,
                    ..job.clone()
                };
                Some(match &release {
                    Release::Completed {
                        needs_review,
                        outcome,
                    } => Job {
                        status: JobStatus::Completed,
                        needs_review: job.needs_review || *needs_review,
                        outcome: Some(outcome.clone()),
                        error_message: None,
                        ..released
                    },
                    Release::Failed { error, outcome } => Job {
                        status: JobStatus::Failed,
                        error_message: Some(error.clone()),
                        outcome: outcome.clone().or_else(|| job.outcome.clone()),
                        ..released
                    },
                    Release::Retry { error } => {
                        if job.retries_left() {
                            Job {
                                status: JobStatus::Pending,
                                attempt_count: job.attempt_count + 1,
                                claimed_at: None,
                                ..released
                            }
                        } else {
                            Job {
                                status: JobStatus::Failed,
                                error_message: Some(format!("{}: {}", EXCEEDED_MAX_ATTEMPTS, error)),
                                ..released
                            }
                        }
                    }
                })
            })
            .await?;

        Ok(match cas {
            Cas::Applied(job) => Some(job),
            Cas::Rejected(_) => None,
        })
    }

    /// PROCESSING (claimed before `now - processing_timeout`) -> PENDING or
    /// FAILED in a single conditional write. Concurrent sweepers racing on
    /// the same job produce exactly one applied reclaim.
    pub async fn reclaim(
        &self,
        job_id: &str,
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReclaimOutcome, StoreError> {
        let cas = self
            .update_where(job_id, |job| {
                if !job.is_orphaned(now, processing_timeout) {
                    return None;
                }
                let reclaimed = Job {
                    owner_token: None,
                    claimed_at: None,
                    updated_at: now,
                    ..job.clone()
                };
                Some(if job.retries_left() {
                    Job {
                        status: JobStatus::Pending,
                        attempt_count: job.attempt_count + 1,
                        ..reclaimed
                    }
                } else {
                    Job {
                        status: JobStatus::Failed,
                        error_message: Some(EXCEEDED_MAX_ATTEMPTS.to_string()),
                        ..reclaimed
                    }
                })
            })
            .await?;

        Ok(match cas {
            Cas::Applied(job) if job.status == JobStatus::Pending => ReclaimOutcome::Requeued(job),
            Cas::Applied(job) => ReclaimOutcome::Exhausted(job),
            Cas::Rejected(_) => ReclaimOutcome::Skipped,
        })
    }

    /// External cancellation; allowed from any non-terminal state.
    /// Returns None if the job had already terminated.
    pub async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let cas = self
            .update_where(job_id, |job| {
                (!job.status.is_terminal()).then(|| Job {
                    status: JobStatus::Cancelled,
                    owner_token: None,
                    updated_at: now,
                    ..job.clone()
                })
            })
            .await?;

        Ok(match cas {
            Cas::Applied(job) => Some(job),
            Cas::Rejected(_) => None,
        })
    }

    /// Bump `updated_at` of a PENDING job untouched since before `older_than`.
    /// Returns the job when this caller won the bump and should re-publish it;
    /// a dropped queue message is recovered at most once per window.
    pub async fn touch_stale_pending(
        &self,
        job_id: &str,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let cas = self
            .update_where(job_id, |job| {
                (job.status == JobStatus::Pending && job.updated_at < older_than).then(|| Job {
                    updated_at: now,
                    ..job.clone()
                })
            })
            .await?;

        Ok(match cas {
            Cas::Applied(job) => Some(job),
            Cas::Rejected(_) => None,
        })
    }

    /// Whether `owner_token` may keep working on the job
    pub async fn still_owned(&self, job_id: &str, owner_token: &str) -> Result<bool, StoreError> {
        Ok(self
            .get(job_id)
            .await?
            .map(|job| {
                job.status == JobStatus::Processing
                    && job.owner_token.as_deref() == Some(owner_token)
            })
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryStore};
    use crate::types::{JobPayload, JobType};
    use std::sync::Arc;

    async fn repo_with_job() -> (JobRepository, Job) {
        let repo = JobRepository::new(MemoryStore::shared());
        let job = Job::new(JobType::GenerateOutputs, "codeforces", "1A", JobPayload::default());
        repo.create(&job).await.unwrap();
        (repo, job)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let (repo, job) = repo_with_job().await;
        assert!(matches!(
            repo.create(&job).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_sets_owner_and_timestamp() {
        let (repo, job) = repo_with_job().await;
        let now = Utc::now();

        let outcome = repo.claim(&job.job_id, "worker-a", now).await.unwrap();
        assert!(outcome.is_claimed());
        let claimed = outcome.job();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.owner_token.as_deref(), Some("worker-a"));
        assert_eq!(claimed.claimed_at, Some(now));
    }

    #[tokio::test]
    async fn test_second_claim_conflicts_without_side_effect() {
        let (repo, job) = repo_with_job().await;
        repo.claim(&job.job_id, "worker-a", Utc::now()).await.unwrap();
        let before = repo.require(&job.job_id).await.unwrap();

        let outcome = repo.claim(&job.job_id, "worker-b", Utc::now()).await.unwrap();
        assert!(!outcome.is_claimed());
        assert_eq!(repo.require(&job.job_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let (repo, job) = repo_with_job().await;
        let repo = Arc::new(repo);

        let mut handles = Vec::new();
        for i in 0..32 {
            let repo = repo.clone();
            let job_id = job.job_id.clone();
            handles.push(tokio::spawn(async move {
                repo.claim(&job_id, &format!("worker-{}", i), Utc::now())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let ClaimOutcome::Claimed(job) = handle.await.unwrap() {
                winners.push(job.owner_token.unwrap());
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = repo.require(&job.job_id).await.unwrap();
        assert_eq!(stored.owner_token.as_deref(), Some(winners[0].as_str()));
    }

    #[tokio::test]
    async fn test_release_requires_matching_owner() {
        let (repo, job) = repo_with_job().await;
        repo.claim(&job.job_id, "worker-a", Utc::now()).await.unwrap();

        let stale = repo
            .release(
                &job.job_id,
                "worker-b",
                Release::Failed {
                    error: "boom".into(),
                    outcome: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(
            repo.require(&job.job_id).await.unwrap().status,
            JobStatus::Processing
        );

        let done = repo
            .release(
                &job.job_id,
                "worker-a",
                Release::Completed {
                    needs_review: false,
                    outcome: JobOutcome::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .expect("owner can release");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.owner_token, None);
        assert_eq!(done.error_message, None);
    }

    #[tokio::test]
    async fn test_retry_release_returns_to_pending_until_exhausted() {
        let repo = JobRepository::new(MemoryStore::shared());
        let job = Job::new(JobType::ExtractMetadata, "atcoder", "abc1_a", JobPayload::default())
            .with_max_attempts(1);
        repo.create(&job).await.unwrap();

        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();
        let retried = repo
            .release(&job.job_id, "w", Release::Retry { error: "503".into() }, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.error_message, None);

        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();
        let failed = repo
            .release(&job.job_id, "w", Release::Retry { error: "503".into() }, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed
            .error_message
            .unwrap()
            .starts_with(EXCEEDED_MAX_ATTEMPTS));
    }

    #[tokio::test]
    async fn test_needs_review_is_never_cleared() {
        let (repo, job) = repo_with_job().await;
        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();
        repo.release(
            &job.job_id,
            "w",
            Release::Retry { error: "x".into() },
            Utc::now(),
        )
        .await
        .unwrap();

        // Simulate an earlier attempt having raised the flag
        let mut flagged = repo.require(&job.job_id).await.unwrap();
        flagged.needs_review = true;
        let key = job_key(&job.job_id);
        repo.store
            .put(&key, &serde_json::to_string(&flagged).unwrap())
            .await
            .unwrap();

        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();
        let done = repo
            .release(
                &job.job_id,
                "w",
                Release::Completed {
                    needs_review: false,
                    outcome: JobOutcome::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(done.needs_review);
    }

    #[tokio::test]
    async fn test_reclaim_requeues_then_exhausts() {
        let repo = JobRepository::new(MemoryStore::shared());
        let job = Job::new(JobType::GenerateTestCases, "codeforces", "2B", JobPayload::default())
            .with_max_attempts(1);
        repo.create(&job).await.unwrap();

        let timeout = Duration::seconds(60);
        let long_ago = Utc::now() - Duration::seconds(600);

        repo.claim(&job.job_id, "dead-worker", long_ago).await.unwrap();
        match repo.reclaim(&job.job_id, timeout, Utc::now()).await.unwrap() {
            ReclaimOutcome::Requeued(job) => {
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.attempt_count, 1);
                assert_eq!(job.owner_token, None);
            }
            other => panic!("expected requeue, got {:?}", other),
        }

        repo.claim(&job.job_id, "dead-again", long_ago).await.unwrap();
        match repo.reclaim(&job.job_id, timeout, Utc::now()).await.unwrap() {
            ReclaimOutcome::Exhausted(job) => {
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.error_message.as_deref(), Some(EXCEEDED_MAX_ATTEMPTS));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reclaim_skips_fresh_claims() {
        let (repo, job) = repo_with_job().await;
        repo.claim(&job.job_id, "alive", Utc::now()).await.unwrap();

        let outcome = repo
            .reclaim(&job.job_id, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ReclaimOutcome::Skipped);
        assert!(repo.still_owned(&job.job_id, "alive").await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaimed_worker_cannot_release() {
        let (repo, job) = repo_with_job().await;
        let long_ago = Utc::now() - Duration::seconds(600);
        repo.claim(&job.job_id, "slow", long_ago).await.unwrap();
        repo.reclaim(&job.job_id, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        repo.claim(&job.job_id, "fresh", Utc::now()).await.unwrap();

        let stale = repo
            .release(
                &job.job_id,
                "slow",
                Release::Completed {
                    needs_review: false,
                    outcome: JobOutcome::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(stale.is_none());
        assert!(repo.still_owned(&job.job_id, "fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_blocks_release_and_terminal_jobs_stay_put() {
        let (repo, job) = repo_with_job().await;
        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();

        let cancelled = repo.cancel(&job.job_id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.owner_token, None);

        let released = repo
            .release(
                &job.job_id,
                "w",
                Release::Completed {
                    needs_review: false,
                    outcome: JobOutcome::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(released.is_none());
        assert!(repo.cancel(&job.job_id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_stale_pending_once_per_window() {
        let (repo, job) = repo_with_job().await;
        let later = job.updated_at + Duration::seconds(600);
        let cutoff = later - Duration::seconds(60);

        assert!(repo
            .touch_stale_pending(&job.job_id, cutoff, later)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .touch_stale_pending(&job.job_id, cutoff, later)
            .await
            .unwrap()
            .is_none());

        repo.claim(&job.job_id, "w", later).await.unwrap();
        let much_later = later + Duration::seconds(600);
        assert!(repo
            .touch_stale_pending(&job.job_id, much_later, much_later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_orphaned() {
        let repo = JobRepository::new(MemoryStore::shared());
        let old = Job::new(JobType::GenerateOutputs, "codeforces", "1A", JobPayload::default());
        let fresh = Job::new(JobType::GenerateOutputs, "codeforces", "1B", JobPayload::default());
        let idle = Job::new(JobType::GenerateOutputs, "codeforces", "1C", JobPayload::default());
        for job in [&old, &fresh, &idle] {
            repo.create(job).await.unwrap();
        }
        repo.claim(&old.job_id, "w1", Utc::now() - Duration::seconds(600))
            .await
            .unwrap();
        repo.claim(&fresh.job_id, "w2", Utc::now()).await.unwrap();

        let orphans = repo
            .list_orphaned(Utc::now(), Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].job_id, old.job_id);
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_records() {
        let store = MemoryStore::shared();
        let repo = JobRepository::new(store.clone());
        let job = Job::new(JobType::GenerateOutputs, "codeforces", "1A", JobPayload::default());
        repo.create(&job).await.unwrap();
        store.put(&job_key("zzz-garbage"), "{not json").await.unwrap();

        let jobs = repo.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn test_ensure_successor_creates_recorded_stage_once() {
        let repo = JobRepository::new(MemoryStore::shared());
        let job = Job::new(JobType::GenerateSolution, "codeforces", "1A", JobPayload::default())
            .with_timeout_ms(3000);
        repo.create(&job).await.unwrap();
        repo.claim(&job.job_id, "w", Utc::now()).await.unwrap();

        let payload = JobPayload {
            case_count: Some(7),
            ..Default::default()
        };
        let done = repo
            .release(
                &job.job_id,
                "w",
                Release::Completed {
                    needs_review: false,
                    outcome: JobOutcome {
                        next_job_id: Some("next-1".into()),
                        next_payload: Some(payload.clone()),
                        ..Default::default()
                    },
                },
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();

        let created = repo.ensure_successor(&done).await.unwrap().unwrap();
        assert_eq!(created.job_id, "next-1");
        assert_eq!(created.job_type, JobType::GenerateTestGenerator);
        assert_eq!(created.status, JobStatus::Pending);
        assert_eq!(created.payload, payload);
        assert_eq!(created.timeout_ms, 3000);
        assert!(repo.ensure_successor(&done).await.unwrap().is_none());
        assert!(repo.get("next-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_successor_ignores_chain_end() {
        let (repo, job) = repo_with_job().await;
        assert!(repo.ensure_successor(&job).await.unwrap().is_none());
    }
}
