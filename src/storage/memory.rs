use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Job, JobRecord, OutputLine};
use crate::storage::JobStore;

/// Job store that keeps everything in memory. Used by tests and by `serve
/// --ephemeral`, where nothing should outlive the process.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate records left behind by a previous run.
    pub fn with_records(records: Vec<JobRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.job.id, r)).collect()),
        }
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Option<JobRecord> {
        self.records.read().await.get(&job_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));
        Ok(records)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&job.id) {
            Some(record) => record.job = job.clone(),
            None => {
                records.insert(
                    job.id,
                    JobRecord {
                        job: job.clone(),
                        output: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn append_output(&self, job_id: Uuid, line: &OutputLine) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(&job_id) {
            record.output.push(line.clone());
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.records.write().await.remove(&job_id);
        Ok(())
    }
}
