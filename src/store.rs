use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::*;

use crate::Job;

/// Head of the pending sequence; workers BRPOP from the opposite end.
pub const PENDING_LIST: &str = "meeting_processing_queue";
pub const IN_FLIGHT_SET: &str = "processing_meetings";
pub const DEAD_LETTER_LIST: &str = "meeting_processing_dead_letter";
pub const JOB_KEY_PREFIX: &str = "job:";

fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),
    #[error("stored record for job {job_id} is malformed: {source}")]
    Malformed {
        job_id: String,
        source: serde_json::Error,
    },
    #[error("embedded queue closed")]
    Closed,
}

/// Broker-side state owned by the queue core: the pending sequence, the
/// in-flight set, a dead-letter list, and one expiring record per job id.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Appends an id to the head of the pending sequence. Not idempotent:
    /// pushing the same id twice yields two dequeue events.
    async fn push_pending(&self, job_id: &str) -> Result<(), StoreError>;

    /// Removes the id at the tail of the pending sequence, waiting up to
    /// `timeout`, and returns `None` once it elapses. Safe for concurrent
    /// callers; any given id is delivered to exactly one of them.
    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn push_dead_letter(&self, job_id: &str) -> Result<(), StoreError>;

    async fn mark_in_flight(&self, job_id: &str) -> Result<(), StoreError>;
    async fn unmark_in_flight(&self, job_id: &str) -> Result<(), StoreError>;

    async fn pending_length(&self) -> Result<usize, StoreError>;
    async fn in_flight_count(&self) -> Result<usize, StoreError>;
    async fn dead_letter_length(&self) -> Result<usize, StoreError>;

    /// Whole-record upsert; a later save overwrites the record and re-arms
    /// its expiry. Callers read-modify-write, there are no partial updates.
    async fn save(&self, job: &Job, ttl: Duration) -> Result<(), StoreError>;

    async fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        trace!("Connecting to redis:{}", url);
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisStore { client, conn })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn push_pending(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(PENDING_LIST, job_id).await?;
        Ok(())
    }

    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        // BRPOP would stall every other command on the shared multiplexed
        // pipeline, so blocking pops get a connection of their own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> =
            conn.brpop(PENDING_LIST, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, job_id)| job_id))
    }

    async fn push_dead_letter(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(DEAD_LETTER_LIST, job_id).await?;
        Ok(())
    }

    async fn mark_in_flight(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(IN_FLIGHT_SET, job_id).await?;
        Ok(())
    }

    async fn unmark_in_flight(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(IN_FLIGHT_SET, job_id).await?;
        Ok(())
    }

    async fn pending_length(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(PENDING_LIST).await?)
    }

    async fn in_flight_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(IN_FLIGHT_SET).await?)
    }

    async fn dead_letter_length(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(DEAD_LETTER_LIST).await?)
    }

    async fn save(&self, job: &Job, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(job).map_err(|source| StoreError::Malformed {
            job_id: job.id.clone(),
            source,
        })?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(job_key(&job.id), raw, ttl.as_secs()).await?;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(job_id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|source| StoreError::Malformed {
                        job_id: job_id.to_string(),
                        source,
                    })
            }
        }
    }
}
