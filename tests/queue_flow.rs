use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use meetq::memory::MemoryStore;
use meetq::queue::TaskQueue;
use meetq::worker::{self, JobProcessor};
use meetq::{Job, JobRequest, Status};

const POP: Duration = Duration::from_millis(200);

fn request(meeting_id: i64) -> JobRequest {
    JobRequest {
        meeting_id,
        file_path: format!("/data/uploads/{meeting_id}.mp3"),
        filename: format!("{meeting_id}.mp3"),
    }
}

fn queue_with(max_attempts: u32) -> TaskQueue {
    TaskQueue::new(Arc::new(MemoryStore::new()), max_attempts)
}

/// Fails the first `failures_per_job` attempts of every job, then succeeds,
/// counting every call per job id.
struct ScriptedProcessor {
    failures_per_job: u32,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedProcessor {
    fn new(failures_per_job: u32) -> Self {
        ScriptedProcessor {
            failures_per_job,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, job_id: &str) -> u32 {
        *self.calls.lock().unwrap().get(job_id).unwrap_or(&0)
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, Error> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(job.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count <= self.failures_per_job {
            return Err(anyhow!("transcription backend unavailable"));
        }
        Ok(json!({ "transcript_length": 42, "language": "en" }))
    }
}

async fn wait_for_terminal(queue: &TaskQueue, job_id: &str) -> Job {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(job) = queue.get_status(job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn failed_attempt_requeues_and_then_completes() -> Result<(), Error> {
    let queue = queue_with(3);
    let job_id = queue.enqueue(request(1)).await?;

    let job = queue.next_job(POP).await?.expect("job should be pending");
    assert_eq!(job.id, job_id);
    assert_eq!(job.status, Status::Processing);
    assert!(job.started_at.is_some());

    queue.fail_job(&job.id, "whisper model crashed", true).await?;
    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.status, Status::Queued);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("whisper model crashed"));
    assert!(job.failed_at.is_some());

    let job = queue
        .next_job(POP)
        .await?
        .expect("retried job should be pending again");
    assert_eq!(job.id, job_id);
    assert_eq!(job.attempts, 1);

    queue
        .complete_job(&job.id, json!({ "transcript_length": 42 }))
        .await?;
    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert!(job.result.is_some());

    let stats = queue.stats().await?;
    assert_eq!(stats.pending_length, 0);
    assert_eq!(stats.in_flight_count, 0);
    Ok(())
}

#[tokio::test]
async fn single_attempt_job_fails_terminally() -> Result<(), Error> {
    let queue = queue_with(1);
    let job_id = queue.enqueue(request(2)).await?;

    let job = queue.next_job(POP).await?.expect("job should be pending");
    queue.fail_job(&job.id, "corrupt audio container", true).await?;

    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("corrupt audio container"));
    assert!(job.failed_at.is_some());

    // Terminal means terminal: nothing left to dequeue.
    assert!(queue.next_job(POP).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn stats_on_an_empty_store_are_zero_and_stable() -> Result<(), Error> {
    let queue = queue_with(3);
    let first = queue.stats().await?;
    assert_eq!(first.pending_length, 0);
    assert_eq!(first.in_flight_count, 0);

    let second = queue.stats().await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn status_of_an_unknown_id_is_not_found_not_an_error() -> Result<(), Error> {
    let queue = queue_with(3);
    assert!(queue.get_status("meeting_999_0").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn retried_job_reenters_behind_work_pending_at_failure_time() -> Result<(), Error> {
    let queue = queue_with(3);
    let a = queue.enqueue(request(10)).await?;
    let b = queue.enqueue(request(11)).await?;

    let job = queue.next_job(POP).await?.expect("a should pop first");
    assert_eq!(job.id, a);
    queue.fail_job(&a, "boom", true).await?;

    // A re-entered at the fresh-work end, so B is delivered before A's retry.
    let job = queue.next_job(POP).await?.expect("b should pop next");
    assert_eq!(job.id, b);
    let job = queue.next_job(POP).await?.expect("a's retry pops last");
    assert_eq!(job.id, a);
    assert!(queue.next_job(POP).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn attempts_never_exceed_max_and_exhaustion_is_terminal() -> Result<(), Error> {
    let queue = queue_with(3);
    let job_id = queue.enqueue(request(12)).await?;

    for expected_attempts in 1..=3u32 {
        let job = queue.next_job(POP).await?.expect("job should be pending");
        assert_eq!(job.id, job_id);
        queue.fail_job(&job.id, "flaky dependency", true).await?;

        let job = queue.get_status(&job_id).await?.expect("record should exist");
        assert_eq!(job.attempts, expected_attempts);
        if expected_attempts < 3 {
            assert_eq!(job.status, Status::Queued);
        } else {
            assert_eq!(job.status, Status::Failed);
        }
    }

    assert!(queue.next_job(POP).await?.is_none());
    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.attempts, job.max_attempts);
    Ok(())
}

#[tokio::test]
async fn failure_without_retry_is_immediately_terminal() -> Result<(), Error> {
    let queue = queue_with(3);
    let job_id = queue.enqueue(request(13)).await?;

    let job = queue.next_job(POP).await?.expect("job should be pending");
    queue.fail_job(&job.id, "unsupported codec", false).await?;

    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 1);
    assert!(queue.next_job(POP).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn saved_record_round_trips_field_for_field() -> Result<(), Error> {
    let queue = queue_with(3);
    let job_id = queue.enqueue(request(14)).await?;

    let job = queue.get_status(&job_id).await?.expect("record should exist");
    assert_eq!(job.id, job_id);
    assert_eq!(job.meeting_id, 14);
    assert_eq!(job.file_path, "/data/uploads/14.mp3");
    assert_eq!(job.filename, "14.mp3");
    assert_eq!(job.status, Status::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_none());
    assert!(job.failed_at.is_none());
    assert!(job.last_error.is_none());
    assert!(job.result.is_none());
    Ok(())
}

#[tokio::test]
async fn dequeue_moves_the_id_into_the_in_flight_set() -> Result<(), Error> {
    let queue = queue_with(3);
    queue.enqueue(request(15)).await?;

    assert_eq!(queue.stats().await?.pending_length, 1);
    let job = queue.next_job(POP).await?.expect("job should be pending");

    let stats = queue.stats().await?;
    assert_eq!(stats.pending_length, 0);
    assert_eq!(stats.in_flight_count, 1);

    queue.complete_job(&job.id, json!({})).await?;
    assert_eq!(queue.stats().await?.in_flight_count, 0);
    Ok(())
}

#[tokio::test]
async fn worker_loop_retries_until_success() -> Result<(), Error> {
    let queue = queue_with(3);
    let processor = Arc::new(ScriptedProcessor::new(1));
    let cancel_token = CancellationToken::new();
    let handle = tokio::spawn(worker::start(
        cancel_token.clone(),
        queue.clone(),
        processor.clone(),
        Duration::from_millis(50),
    ));

    let job_id = queue.enqueue(request(20)).await?;
    let job = wait_for_terminal(&queue, &job_id).await;
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(processor.calls_for(&job_id), 2);

    cancel_token.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

#[tokio::test]
async fn worker_loop_exhausts_attempts_into_terminal_failure() -> Result<(), Error> {
    let queue = queue_with(2);
    let processor = Arc::new(ScriptedProcessor::new(u32::MAX));
    let cancel_token = CancellationToken::new();
    let handle = tokio::spawn(worker::start(
        cancel_token.clone(),
        queue.clone(),
        processor.clone(),
        Duration::from_millis(50),
    ));

    let job_id = queue.enqueue(request(21)).await?;
    let job = wait_for_terminal(&queue, &job_id).await;
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(processor.calls_for(&job_id), 2);
    assert_eq!(
        job.last_error.as_deref(),
        Some("transcription backend unavailable")
    );

    cancel_token.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

#[tokio::test]
async fn concurrent_workers_process_each_job_exactly_once() -> Result<(), Error> {
    let queue = queue_with(3);
    let processor = Arc::new(ScriptedProcessor::new(0));
    let cancel_token = CancellationToken::new();

    let mut workers = vec![];
    for _ in 0..2 {
        workers.push(tokio::spawn(worker::start(
            cancel_token.clone(),
            queue.clone(),
            processor.clone(),
            Duration::from_millis(50),
        )));
    }

    let mut job_ids = vec![];
    for meeting_id in 30..38 {
        job_ids.push(queue.enqueue(request(meeting_id)).await?);
    }

    for job_id in &job_ids {
        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, Status::Completed);
        assert_eq!(processor.calls_for(job_id), 1);
    }

    let stats = queue.stats().await?;
    assert_eq!(stats.pending_length, 0);
    assert_eq!(stats.in_flight_count, 0);

    cancel_token.cancel();
    for handle in workers {
        tokio::time::timeout(Duration::from_secs(2), handle).await??;
    }
    Ok(())
}

#[tokio::test]
async fn cancelled_worker_stops_within_the_pop_timeout() -> Result<(), Error> {
    let queue = queue_with(3);
    let cancel_token = CancellationToken::new();
    let handle = tokio::spawn(worker::start(
        cancel_token.clone(),
        queue,
        Arc::new(ScriptedProcessor::new(0)),
        Duration::from_millis(50),
    ));

    cancel_token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await??;
    Ok(())
}
