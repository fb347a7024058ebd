//! Queue transport
//!
//! At-least-once delivery of "job is ready" notifications. Receiving a
//! message removes it from the queue, which is the acknowledgement: a worker
//! that crashes afterwards loses the message and the orphan sweeper brings
//! the job back.

use crate::store::StoreError;
use crate::types::{Job, JobType, QueueKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Wire message; opaque to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: String,
    pub job_type: JobType,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            enqueued_at: Utc::now(),
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.job_type.queue()
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<(), StoreError>;

    /// Hold the message back until `ready_at`; see `promote_due`
    async fn publish_at(
        &self,
        message: &QueueMessage,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove and return the next message on `kind`, waiting at most `wait`
    async fn receive(
        &self,
        kind: QueueKind,
        wait: Duration,
    ) -> Result<Option<QueueMessage>, StoreError>;

    /// Move every delayed message whose time has come onto its ready queue.
    /// Safe to call from several processes at once.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn depth(&self, kind: QueueKind) -> Result<usize, StoreError>;
}

pub type SharedQueue = Arc<dyn QueueTransport>;

#[derive(Default)]
struct MemoryQueueState {
    ready: [VecDeque<QueueMessage>; 3],
    delayed: Vec<(DateTime<Utc>, QueueMessage)>,
}

/// In-process transport used by tests and the single-node dev mode
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    notifiers: [Notify; 3],
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<MemoryQueue> {
        Arc::new(Self::new())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_pop(&self, kind: QueueKind) -> Option<QueueMessage> {
        self.state().ready[kind.index()].pop_front()
    }

    /// Snapshot of messages waiting on `kind`, oldest first
    pub fn pending(&self, kind: QueueKind) -> Vec<QueueMessage> {
        self.state().ready[kind.index()].iter().cloned().collect()
    }

    pub fn delayed_len(&self) -> usize {
        self.state().delayed.len()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), StoreError> {
        let kind = message.queue();
        self.state().ready[kind.index()].push_back(message.clone());
        self.notifiers[kind.index()].notify_one();
        Ok(())
    }

    async fn publish_at(
        &self,
        message: &QueueMessage,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state().delayed.push((ready_at, message.clone()));
        Ok(())
    }

    async fn receive(
        &self,
        kind: QueueKind,
        wait: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.try_pop(kind) {
                return Ok(Some(message));
            }
            let notified = self.notifiers[kind.index()].notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(kind));
            }
        }
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due: Vec<QueueMessage> = {
            let mut state = self.state();
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
                .into_iter()
                .partition(|(ready_at, _)| *ready_at <= now);
            state.delayed = later;
            due.into_iter().map(|(_, m)| m).collect()
        };
        for message in &due {
            self.publish(message).await?;
        }
        Ok(due.len())
    }

    async fn depth(&self, kind: QueueKind) -> Result<usize, StoreError> {
        Ok(self.state().ready[kind.index()].len())
    }
}
