/// Worker Pools
///
/// One pool per queue partition; each slot pulls one message at a time, so
/// pool size is both the concurrency bound and the backpressure for that
/// partition. Receiving a message acknowledges it.
///
/// Shutdown is checked between receives and never interrupts a receive or
/// an in-flight job.

use crate::pipeline::{Orchestrator, ProcessOutcome};
use caseforge_common::types::QueueKind;
use caseforge_common::SharedQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Blocking receive timeout; also the worst-case shutdown latency
const POLL_WAIT: Duration = Duration::from_secs(5);

/// Pause after a transport error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Fresh token per attempt so a stale attempt of the same worker can never
/// release a newer one
pub fn owner_token(worker_id: &str) -> String {
    format!("{}:{}", worker_id, Uuid::new_v4())
}

pub struct WorkerPool {
    pub kind: QueueKind,
    pub size: usize,
}

impl WorkerPool {
    pub fn new(kind: QueueKind, size: usize) -> Self {
        Self { kind, size }
    }

    pub fn spawn(
        &self,
        worker_id: &str,
        queue: SharedQueue,
        orchestrator: Arc<Orchestrator>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!(queue = %self.kind, size = self.size, "Starting worker pool");
        (0..self.size)
            .map(|slot| {
                tokio::spawn(worker_loop(
                    format!("{}/{}-{}", worker_id, self.kind, slot),
                    self.kind,
                    queue.clone(),
                    orchestrator.clone(),
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

#[instrument(skip(queue, orchestrator, shutdown), fields(queue = %kind))]
async fn worker_loop(
    worker_id: String,
    kind: QueueKind,
    queue: SharedQueue,
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.receive(kind, POLL_WAIT).await {
            Ok(Some(message)) => {
                let token = owner_token(&worker_id);
                match orchestrator.process(&message, &token).await {
                    Ok(ProcessOutcome::Conflict) | Ok(ProcessOutcome::Dropped) => {}
                    Ok(outcome) => debug!(
                        job_id = %message.job_id,
                        outcome = outcome.label(),
                        "Message handled"
                    ),
                    Err(e) => {
                        // The job stays PROCESSING; the sweeper reclaims it
                        error!(job_id = %message.job_id, error = ?e, "Failed to process job");
                    }
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Queue receive failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    info!(worker = %worker_id, "Worker stopped");
}
