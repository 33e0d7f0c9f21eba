use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::store::{QueueStore, StoreError};
use crate::Job;

/// In-process store used by `--embedded` mode and the test suite.
///
/// Delivery semantics match the broker-backed store: the pending sequence is
/// an MPMC channel, so concurrent poppers receive any given id at most once,
/// and record expiry is checked on load the way the broker would have already
/// dropped the key.
pub struct MemoryStore {
    pending_tx: async_channel::Sender<String>,
    pending_rx: async_channel::Receiver<String>,
    in_flight: Mutex<HashSet<String>>,
    dead_letter: Mutex<Vec<String>>,
    records: Mutex<HashMap<String, StoredRecord>>,
}

struct StoredRecord {
    raw: String,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = async_channel::unbounded();
        MemoryStore {
            pending_tx,
            pending_rx,
            in_flight: Mutex::new(HashSet::new()),
            dead_letter: Mutex::new(Vec::new()),
            records: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, job_id: &str, raw: &str, ttl: Duration) {
        self.records.lock().unwrap().insert(
            job_id.to_string(),
            StoredRecord {
                raw: raw.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn push_pending(&self, job_id: &str) -> Result<(), StoreError> {
        self.pending_tx
            .send(job_id.to_string())
            .await
            .map_err(|_| StoreError::Closed)
    }

    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        match tokio::time::timeout(timeout, self.pending_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(job_id)) => Ok(Some(job_id)),
            Ok(Err(_)) => Err(StoreError::Closed),
        }
    }

    async fn push_dead_letter(&self, job_id: &str) -> Result<(), StoreError> {
        self.dead_letter.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn mark_in_flight(&self, job_id: &str) -> Result<(), StoreError> {
        self.in_flight.lock().unwrap().insert(job_id.to_string());
        Ok(())
    }

    async fn unmark_in_flight(&self, job_id: &str) -> Result<(), StoreError> {
        self.in_flight.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn pending_length(&self) -> Result<usize, StoreError> {
        Ok(self.pending_rx.len())
    }

    async fn in_flight_count(&self) -> Result<usize, StoreError> {
        Ok(self.in_flight.lock().unwrap().len())
    }

    async fn dead_letter_length(&self) -> Result<usize, StoreError> {
        Ok(self.dead_letter.lock().unwrap().len())
    }

    async fn save(&self, job: &Job, ttl: Duration) -> Result<(), StoreError> {
        let raw = serde_json::to_string(job).map_err(|source| StoreError::Malformed {
            job_id: job.id.clone(),
            source,
        })?;
        self.records.lock().unwrap().insert(
            job.id.clone(),
            StoredRecord {
                raw,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let raw = {
            let mut records = self.records.lock().unwrap();
            match records.get(job_id) {
                None => return Ok(None),
                Some(record) if record.expires_at <= Instant::now() => {
                    records.remove(job_id);
                    return Ok(None);
                }
                Some(record) => record.raw.clone(),
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                job_id: job_id.to_string(),
                source,
            })
    }
}
