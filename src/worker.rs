use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::queue::TaskQueue;
use crate::Job;

/// Fixed delay before retrying the dequeue step after a broker-level error.
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The external transcription + summarization pipeline, seen by the queue
/// core as one opaque operation.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Runs the full pipeline for one job. Must be restartable from scratch;
    /// a retried job arrives with no partial state.
    async fn process(&self, job: &Job) -> Result<serde_json::Value, Error>;
}

/// Stand-in for the real pipeline.
pub struct SimulatedProcessor;

#[async_trait]
impl JobProcessor for SimulatedProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, Error> {
        sleep(Duration::from_millis(100)).await;
        if job.meeting_id % 12 == 0 {
            return Err(anyhow!("Simulating transcription failure"));
        }

        Ok(json!({
            "transcript_length": job.filename.len() * 80,
            "language": "en",
            "summary_length": job.filename.len() * 8,
        }))
    }
}

pub async fn start(
    cancel_token: CancellationToken,
    queue: TaskQueue,
    processor: Arc<dyn JobProcessor>,
    pop_timeout: Duration,
) {
    loop {
        // The only cancellation point. A job that is mid-process runs to
        // completion before the token is looked at again, and the pop itself
        // is not raced against the token: dropping a blocking pop that has
        // already taken an id off the broker would lose the job.
        if cancel_token.is_cancelled() {
            debug!("Worker Cancelled");
            break;
        }

        let job = match queue.next_job(pop_timeout).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(err) => {
                error!(message = "Error taking next job", error = ?err);
                sleep(DEQUEUE_RETRY_DELAY).await;
                continue;
            }
        };

        match process(&*processor, &job).await {
            Ok(result) => {
                if let Err(err) = queue.complete_job(&job.id, result).await {
                    error!(message = "Failed to record completion", job_id = %job.id, error = ?err);
                }
            }
            Err(err) => {
                if let Err(err) = queue.fail_job(&job.id, &err.to_string(), true).await {
                    error!(message = "Failed to record failure", job_id = %job.id, error = ?err);
                }
            }
        };
    }
    info!("Worker stopped.");
}

#[instrument(skip(processor, job), fields(job_id = %job.id))]
async fn process(processor: &dyn JobProcessor, job: &Job) -> Result<serde_json::Value, Error> {
    debug!(message = "Picked up job", attempts = job.attempts);
    processor.process(job).await
}
