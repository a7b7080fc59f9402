use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    pub subject_id: String,
    pub args: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub singleton: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub kind: String,
    pub subject_id: String,
    pub args: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub singleton: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub(crate) fn into_job(self) -> Job {
        Job {
            id: self.id,
            kind: self.kind,
            subject_id: self.subject_id,
            args: self.args,
            run_at: self.run_at,
            status: JobStatus::parse(&self.status).unwrap_or(JobStatus::Pending),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            singleton: self.singleton,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// `max_attempts` declared per job kind (spec §4.4: "default 20; `deliver`
/// uses 1").
pub fn default_max_attempts(kind: &str) -> i32 {
    match kind {
        "deliver" => 1,
        _ => 20,
    }
}

/// Whether a kind is deduplicated by `(kind, subject_id)` (spec §4.4:
/// "for kinds tagged singleton-per-subject"). Every job kind in this system
/// acts on one subject at a time and should not be double-queued.
pub fn is_singleton(_kind: &str) -> bool {
    true
}
