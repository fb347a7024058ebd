use crate::queue::{QueueMessage, QueueTransport};
use crate::store::{KvStore, StoreError};
use crate::types::QueueKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

/// Redis key layout - defines only naming, not runtime logic.
/// Keeps producer (CLI) and worker from drifting apart.
pub const KEY_PREFIX: &str = "caseforge";
pub const JOB_PREFIX: &str = "caseforge:job:";
pub const TESTCASES_PREFIX: &str = "caseforge:testcases:";
pub const QUEUE_PREFIX: &str = "caseforge:queue";
pub const DELAYED_QUEUE: &str = "caseforge:queue:delayed";
pub const EVENTS_CHANNEL: &str = "caseforge:events";

/// Max delayed messages moved per promotion pass
const PROMOTE_BATCH: isize = 100;

pub fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}

pub fn testcases_key(platform: &str, problem_id: &str) -> String {
    format!("{}{}:{}", TESTCASES_PREFIX, platform, problem_id)
}

pub fn queue_name(kind: QueueKind) -> String {
    format!("{}:{}", QUEUE_PREFIX, kind)
}

/// Compare-and-set on a whole value, executed atomically server-side
const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

pub async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: redis::Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.set_nx(key, value).await?)
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(key)
            .arg(expected)
            .arg(new_value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(format!("{}*", prefix)).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        // Keys deleted between SCAN and MGET come back as nil
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }
}

/// List-per-partition transport with a sorted set for delayed delivery
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn encode(message: &QueueMessage) -> Result<String, StoreError> {
    serde_json::to_string(message).map_err(|source| StoreError::Codec {
        key: message.job_id.clone(),
        source,
    })
}

#[async_trait]
impl QueueTransport for RedisQueue {
    /// RPUSH for FIFO semantics
    async fn publish(&self, message: &QueueMessage) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = encode(message)?;
        let _: () = conn.rpush(queue_name(message.queue()), payload).await?;
        Ok(())
    }

    async fn publish_at(
        &self,
        message: &QueueMessage,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = encode(message)?;
        let _: () = conn
            .zadd(DELAYED_QUEUE, payload, ready_at.timestamp_millis())
            .await?;
        Ok(())
    }

    /// BLPOP with a timeout so the caller can notice shutdown
    async fn receive(
        &self,
        kind: QueueKind,
        wait: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let mut conn = self.conn.clone();
        let queue = queue_name(kind);
        let popped: Option<(String, String)> = conn.blpop(&queue, wait.as_secs_f64()).await?;

        match popped {
            Some((_key, payload)) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|source| StoreError::Codec { key: queue, source }),
            None => Ok(None),
        }
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(DELAYED_QUEUE, "-inf", now.timestamp_millis(), 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for payload in due {
            // ZREM arbitrates between concurrent promoters
            let removed: i64 = conn.zrem(DELAYED_QUEUE, &payload).await?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<QueueMessage>(&payload) {
                Ok(message) => {
                    let _: () = conn.rpush(queue_name(message.queue()), &payload).await?;
                    promoted += 1;
                }
                Err(e) => warn!(error = %e, "Dropping undecodable delayed message"),
            }
        }
        Ok(promoted)
    }

    async fn depth(&self, kind: QueueKind) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue_name(kind)).await?)
    }
}
