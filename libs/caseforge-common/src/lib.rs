pub mod config;
pub mod jobs;
pub mod languages;
pub mod problem;
pub mod queue;
pub mod redis;
pub mod store;
pub mod testcases;
pub mod types;

use std::sync::Arc;

// Re-export commonly used types for convenience
pub use config::{Config, StoreBackend};
pub use jobs::{ClaimOutcome, JobRepository, ReclaimOutcome, Release};
pub use languages::{LanguageSpec, LanguageTable};
pub use problem::ProblemRef;
pub use queue::{QueueMessage, QueueTransport, SharedQueue};
pub use store::{KvStore, SharedStore, StoreError};
pub use testcases::TestCaseRepository;
pub use types::{
    ExecutionResult, ExecutionStatus, Job, JobOutcome, JobPayload, JobStatus, JobType, QueueKind,
    TestCase,
};

/// Store and transport handles for the configured backend
#[derive(Clone)]
pub struct Backends {
    pub store: SharedStore,
    pub queue: SharedQueue,
    /// Raw connection for pub/sub and metrics; None for the memory backend
    pub redis: Option<::redis::aio::ConnectionManager>,
}

impl Backends {
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        match config.store_backend {
            StoreBackend::Redis => {
                let conn = redis::connect(&config.redis_url).await?;
                Ok(Self {
                    store: Arc::new(redis::RedisStore::new(conn.clone())),
                    queue: Arc::new(redis::RedisQueue::new(conn.clone())),
                    redis: Some(conn),
                })
            }
            StoreBackend::Memory => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: store::MemoryStore::shared(),
            queue: queue::MemoryQueue::shared(),
            redis: None,
        }
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.store.clone())
    }

    pub fn testcases(&self) -> TestCaseRepository {
        TestCaseRepository::new(self.store.clone())
    }

    /// Create a PENDING job and publish its first message
    pub async fn submit(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs().create(job).await?;
        self.queue.publish(&QueueMessage::for_job(job)).await
    }
}
