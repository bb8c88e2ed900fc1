pub mod jobs;
pub mod memory;
pub mod site_rules;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Job, JobRecord, OutputLine, SiteRule};

/// Durable storage for job records. Only the job registry writes through it.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_jobs(&self) -> Result<Vec<JobRecord>>;
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn append_output(&self, job_id: Uuid, line: &OutputLine) -> Result<()>;
    async fn delete_job(&self, job_id: Uuid) -> Result<()>;
}

/// Read-only view of the site rules, which are maintained elsewhere.
#[async_trait]
pub trait SiteRuleStore: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<SiteRule>>;
}
