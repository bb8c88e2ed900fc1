use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::models::{Job, JobRecord, OutputLine};
use crate::storage::JobStore;

/// Filesystem job store rooted at `data_dir/jobs/`.
///
/// Each job gets its own directory holding `job.json` (metadata, rewritten
/// atomically on every change) and `output.jsonl` (one captured line per row,
/// append-only).
pub struct FsJobStore {
    jobs_dir: PathBuf,
}

impl FsJobStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let jobs_dir = data_dir.join("jobs");
        tokio::fs::create_dir_all(&jobs_dir)
            .await
            .context("Failed to create jobs directory")?;
        Ok(Self { jobs_dir })
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.jobs_dir.join(job_id.to_string())
    }

    fn meta_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    fn output_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("output.jsonl")
    }

    async fn read_output(&self, job_id: Uuid) -> Result<Vec<OutputLine>> {
        let path = self.output_path(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read job output")?;

        let mut lines = Vec::new();
        for (n, row) in content.lines().enumerate() {
            if row.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OutputLine>(row) {
                Ok(line) => lines.push(line),
                Err(e) => {
                    // A crash mid-append leaves a partial last row.
                    tracing::warn!(
                        "Skipping malformed output row {} for job {}: {}",
                        n + 1,
                        job_id,
                        e
                    );
                }
            }
        }
        Ok(lines)
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn load_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.jobs_dir)
            .await
            .context("Failed to read jobs directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(job_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
            else {
                continue;
            };

            let meta_path = self.meta_path(job_id);
            let content = match tokio::fs::read_to_string(&meta_path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Skipping job {} without readable metadata: {}", job_id, e);
                    continue;
                }
            };
            let job = match serde_json::from_str::<Job>(&content) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("Skipping malformed job file {:?}: {}", meta_path, e);
                    continue;
                }
            };
            let output = self.read_output(job_id).await?;
            records.push(JobRecord { job, output });
        }

        records.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));
        Ok(records)
    }

    /// Atomically write the job metadata: `.tmp` first, then rename.
    async fn save_job(&self, job: &Job) -> Result<()> {
        let job_dir = self.job_dir(job.id);
        tokio::fs::create_dir_all(&job_dir)
            .await
            .context("Failed to create job directory")?;

        let meta_path = self.meta_path(job.id);
        let tmp_path = meta_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(job).context("Failed to serialize job")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary job file")?;
        tokio::fs::rename(&tmp_path, &meta_path)
            .await
            .context("Failed to rename temporary job file")?;

        Ok(())
    }

    /// Append one output row. The job must have been saved first; a deleted
    /// job's directory is never recreated.
    async fn append_output(&self, job_id: Uuid, line: &OutputLine) -> Result<()> {
        if !self.job_dir(job_id).exists() {
            anyhow::bail!("Job {} has no storage directory", job_id);
        }

        let mut row = serde_json::to_string(line).context("Failed to serialize output line")?;
        row.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_path(job_id))
            .await
            .context("Failed to open output file for appending")?;
        file.write_all(row.as_bytes())
            .await
            .context("Failed to append job output")?;
        file.flush().await.context("Failed to flush job output")?;

        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let job_dir = self.job_dir(job_id);
        if job_dir.exists() {
            tokio::fs::remove_dir_all(&job_dir)
                .await
                .context("Failed to remove job directory")?;
        }
        Ok(())
    }
}
