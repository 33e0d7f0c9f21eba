use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use chrono::Utc;
use tracing::*;

use crate::store::{QueueStore, StoreError};
use crate::{Job, JobRequest, QueueStats, Status};

/// Record expiry while a job is live (queued or processing).
pub const LIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Record expiry re-armed by every completion or failure transition. A
/// failure that re-queues the job also saves at this shorter expiry; the next
/// dequeue restores the live one.
pub const TERMINAL_TTL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Policy layer over the queue store: owns job creation and every status
/// transition. Workers and producers share clones of this handle; nothing
/// here is a process-wide singleton.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, max_attempts: u32) -> Self {
        TaskQueue {
            store,
            max_attempts,
        }
    }

    /// Creates the record and makes the job visible to workers.
    pub async fn enqueue(&self, request: JobRequest) -> Result<String, Error> {
        let job = Job::new(request, self.max_attempts);
        // Record first, then the id: a worker must never pop an id whose
        // record has not been written yet.
        self.store.save(&job, LIVE_TTL).await?;
        self.store.push_pending(&job.id).await?;
        debug!(message = "Enqueued job", job_id = %job.id, meeting_id = job.meeting_id);
        Ok(job.id)
    }

    /// Blocks up to `timeout` for a pending id and moves it to processing.
    /// Returns `None` on timeout, on an id whose record has expired, and on a
    /// malformed record (which is routed to the dead-letter list instead of
    /// crashing the caller).
    pub async fn next_job(&self, timeout: Duration) -> Result<Option<Job>, Error> {
        let Some(job_id) = self.store.pop_pending(timeout).await? else {
            return Ok(None);
        };

        let mut job = match self.store.load(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(message = "Dequeued id has no record, skipping", job_id = %job_id);
                return Ok(None);
            }
            Err(StoreError::Malformed { job_id, source }) => {
                error!(
                    message = "Dequeued record is malformed, dead-lettering",
                    job_id = %job_id,
                    error = %source
                );
                self.store.push_dead_letter(&job_id).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        job.status = Status::Processing;
        job.started_at = Some(Utc::now());
        self.store.mark_in_flight(&job.id).await?;
        self.store.save(&job, LIVE_TTL).await?;
        debug!(message = "Starting job", job_id = %job.id, attempts = job.attempts);
        Ok(Some(job))
    }

    pub async fn complete_job(
        &self,
        job_id: &str,
        result: serde_json::Value,
    ) -> Result<(), Error> {
        self.store.unmark_in_flight(job_id).await?;

        let Some(mut job) = self.store.load(job_id).await? else {
            warn!(message = "No record left to complete, skipping", job_id = %job_id);
            return Ok(());
        };
        if job.status.is_terminal() {
            warn!(message = "Job already terminal, ignoring completion", job_id = %job_id, status = ?job.status);
            return Ok(());
        }

        job.status = Status::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(result);
        self.store.save(&job, TERMINAL_TTL).await?;
        debug!(message = "Completed job", job_id = %job.id);
        Ok(())
    }

    /// Records a failed execution cycle. With `retry` and attempts remaining
    /// the job re-enters the pending sequence alongside fresh arrivals,
    /// keeping its id, creation time, and attempt count; otherwise it fails
    /// terminally.
    pub async fn fail_job(&self, job_id: &str, error_message: &str, retry: bool) -> Result<(), Error> {
        self.store.unmark_in_flight(job_id).await?;

        let Some(mut job) = self.store.load(job_id).await? else {
            warn!(message = "No record left to fail, skipping", job_id = %job_id);
            return Ok(());
        };
        if job.status.is_terminal() {
            warn!(message = "Job already terminal, ignoring failure", job_id = %job_id, status = ?job.status);
            return Ok(());
        }

        job.attempts += 1;
        job.last_error = Some(error_message.to_string());
        job.failed_at = Some(Utc::now());

        if retry && job.attempts < job.max_attempts {
            job.status = Status::Queued;
            // Save before the push so the retried record is never popped in
            // its pre-failure shape.
            self.store.save(&job, TERMINAL_TTL).await?;
            self.store.push_pending(&job.id).await?;
            debug!(message = "Re-queued job", job_id = %job.id, attempts = job.attempts);
        } else {
            job.status = Status::Failed;
            self.store.save(&job, TERMINAL_TTL).await?;
            debug!(message = "Failed job", job_id = %job.id, attempts = job.attempts, error = %error_message);
        }
        Ok(())
    }

    /// Point-in-time read; an expired or never-created id is `None`.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<Job>, Error> {
        Ok(self.store.load(job_id).await?)
    }

    /// Best-effort instantaneous counts; not consistent with a concurrent
    /// `get_status`.
    pub async fn stats(&self) -> Result<QueueStats, Error> {
        Ok(QueueStats {
            pending_length: self.store.pending_length().await?,
            in_flight_count: self.store.in_flight_count().await?,
        })
    }

    pub async fn dead_letter_length(&self) -> Result<usize, Error> {
        Ok(self.store.dead_letter_length().await?)
    }

    pub async fn ping(&self) -> Result<(), Error> {
        Ok(self.store.ping().await?)
    }
}
