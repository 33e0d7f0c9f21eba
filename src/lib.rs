use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod queue;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

/// What a producer hands over when it accepts an upload for processing.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub meeting_id: i64,
    pub file_path: String,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Status {
    /// Completed and failed records never transition again; they only expire.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// The durable unit of work. The stored record is the source of truth; the
/// pending sequence and in-flight set only ever hold the `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub meeting_id: i64,
    pub file_path: String,
    pub filename: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn new(request: JobRequest, max_attempts: u32) -> Self {
        let created_at = Utc::now();
        Job {
            id: format!("meeting_{}_{}", request.meeting_id, created_at.timestamp()),
            meeting_id: request.meeting_id,
            file_path: request.file_path,
            filename: request.filename,
            status: Status::Queued,
            created_at,
            attempts: 0,
            max_attempts,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending_length: usize,
    pub in_flight_count: usize,
}
