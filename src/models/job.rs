use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Serialize an `Arc<str>` as a plain string.
fn serialize_arc_str<S>(data: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(data)
}

fn deserialize_arc_str<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(Arc::from(s))
}

/// Lifecycle of a job: `pending -> running -> {completed | failed | cancelled}`,
/// plus `pending -> failed` when the process cannot be spawned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a captured line came from. `Info` and `Error` lines are written by
/// the runner itself rather than the downloader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputLine {
    /// Position in the job's output, starting at 0 with no gaps.
    pub seq: u64,
    pub stream: OutputStream,
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub text: Arc<str>,
    pub timestamp: DateTime<Utc>,
}

/// Durable job metadata. Captured output is kept alongside it in [`JobRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub urls: Vec<String>,
    pub args: Vec<String>,
    #[serde(default)]
    pub site_pattern: Option<String>,
    #[serde(default)]
    pub site_rule: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub skip_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything needed to register a job. The registry fills in the id,
/// status and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub urls: Vec<String>,
    pub args: Vec<String>,
    pub site_pattern: Option<String>,
    pub site_rule: Option<String>,
    pub requested_by: Option<String>,
}

impl NewJob {
    pub fn into_job(self) -> Job {
        Job {
            id: Uuid::now_v7(),
            status: JobStatus::Pending,
            urls: self.urls,
            args: self.args,
            site_pattern: self.site_pattern,
            site_rule: self.site_rule,
            requested_by: self.requested_by,
            exit_code: None,
            error: None,
            download_count: 0,
            skip_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// A job as exposed to callers: metadata plus the full captured output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    #[serde(flatten)]
    pub job: Job,
    pub output: Vec<OutputLine>,
}
