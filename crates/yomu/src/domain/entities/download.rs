use chrono::NaiveDateTime;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Error,
    Finished,
    Canceled,
}

impl JobStatus {
    /// A job in one of these states blocks a duplicate enqueue.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running | JobStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    User,
    Auto,
}

/// In-memory record of a chapter download, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub chapter_id: i64,
    pub work_id: i64,
    pub source_id: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub retry_count: u32,
    pub origin: JobOrigin,
    pub enqueued_at: NaiveDateTime,
}
