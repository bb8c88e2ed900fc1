use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Job, JobStatus, OutputLine};

/// Everything a subscriber of one job can observe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    /// A captured (or runner-written) output line.
    Output(OutputLine),
    /// Download/skip counters changed.
    Counts { download_count: u64, skip_count: u64 },
    /// A non-terminal status transition (`pending -> running`).
    Status {
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    /// The terminal transition. Always the last event of a job.
    Finished {
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        download_count: u64,
        skip_count: u64,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Output(_) => "output",
            JobEvent::Counts { .. } => "counts",
            JobEvent::Status { .. } => "status",
            JobEvent::Finished { .. } => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Finished { .. })
    }

    pub(crate) fn finished(job: &Job) -> Self {
        JobEvent::Finished {
            status: job.status,
            exit_code: job.exit_code,
            error: job.error.clone(),
            download_count: job.download_count,
            skip_count: job.skip_count,
            timestamp: job.finished_at.unwrap_or_else(Utc::now),
        }
    }

    pub(crate) fn counts(job: &Job) -> Self {
        JobEvent::Counts {
            download_count: job.download_count,
            skip_count: job.skip_count,
        }
    }
}
