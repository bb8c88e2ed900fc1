use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::daemon::events::JobEvent;
use crate::daemon::hub::{Attachment, ReplaySource, Subscription};
use crate::errors::DjrError;
use crate::models::{Job, JobRecord, JobStatus, NewJob, OutputLine, OutputStream};
use crate::storage::JobStore;

pub const RESTART_INTERRUPTED: &str = "Job was interrupted by server restart";

struct JobSlot {
    record: JobRecord,
    /// Live channel for subscribers. Dropped once the job is terminal, which
    /// ends every live stream after its `Finished` event.
    events: Option<broadcast::Sender<JobEvent>>,
}

impl JobSlot {
    fn publish(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
}

/// Authoritative, in-memory set of jobs backed by a [`JobStore`].
///
/// Every mutation of a job goes through here. Appending output and publishing
/// it to subscribers happen under the same write lock, and subscribing takes
/// the history snapshot and the live receiver under the read lock, so a
/// subscriber sees every line exactly once.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    jobs: RwLock<HashMap<Uuid, JobSlot>>,
    event_capacity: usize,
}

impl JobRegistry {
    /// Load persisted jobs. Jobs that were pending or running when the
    /// previous process stopped are marked failed.
    pub async fn open(store: Arc<dyn JobStore>, event_capacity: usize) -> anyhow::Result<Self> {
        let records = store.load_jobs().await?;
        let mut jobs = HashMap::with_capacity(records.len());
        let mut interrupted = 0usize;

        for mut record in records {
            // Rows lost to a crash leave gaps; keep seq dense.
            for (i, line) in record.output.iter_mut().enumerate() {
                line.seq = i as u64;
            }

            if !record.job.status.is_terminal() {
                let now = Utc::now();
                let line = OutputLine {
                    seq: record.output.len() as u64,
                    stream: OutputStream::Error,
                    text: Arc::from(RESTART_INTERRUPTED),
                    timestamp: now,
                };
                if let Err(e) = store.append_output(record.job.id, &line).await {
                    tracing::error!("Failed to persist output for job {}: {}", record.job.id, e);
                }
                record.output.push(line);

                record.job.status = JobStatus::Failed;
                record.job.error = Some(RESTART_INTERRUPTED.to_string());
                record.job.finished_at = Some(now);
                if let Err(e) = store.save_job(&record.job).await {
                    tracing::error!("Failed to persist job {}: {}", record.job.id, e);
                }
                interrupted += 1;
            }

            jobs.insert(
                record.job.id,
                JobSlot {
                    record,
                    events: None,
                },
            );
        }

        tracing::info!(
            "Loaded {} jobs ({} interrupted by restart)",
            jobs.len(),
            interrupted
        );

        Ok(Self {
            store,
            jobs: RwLock::new(jobs),
            event_capacity: event_capacity.max(1),
        })
    }

    /// Register a new pending job and persist it.
    pub async fn create(&self, new_job: NewJob) -> Result<Job, DjrError> {
        let job = new_job.into_job();
        self.store
            .save_job(&job)
            .await
            .map_err(|e| DjrError::Storage(format!("Failed to save job {}: {}", job.id, e)))?;

        let (tx, _) = broadcast::channel(self.event_capacity);
        self.jobs.write().await.insert(
            job.id,
            JobSlot {
                record: JobRecord {
                    job: job.clone(),
                    output: Vec::new(),
                },
                events: Some(tx),
            },
        );

        tracing::info!("Created job {} for {} URL(s)", job.id, job.urls.len());
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|slot| slot.record.clone())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|slot| slot.record.job.clone())
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|slot| slot.record.job.status)
    }

    /// All jobs without their output, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|slot| slot.record.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub async fn stats(&self) -> RegistryStats {
        let jobs = self.jobs.read().await;
        let mut stats = RegistryStats {
            total: jobs.len(),
            ..Default::default()
        };
        for slot in jobs.values() {
            match slot.record.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                _ => {}
            }
        }
        stats
    }

    pub async fn mark_running(&self, job_id: Uuid) -> Result<Job, DjrError> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let slot = slot_mut(&mut jobs, job_id)?;
            check_transition(&slot.record.job, JobStatus::Running)?;

            let now = Utc::now();
            slot.record.job.status = JobStatus::Running;
            slot.record.job.started_at = Some(now);
            slot.publish(JobEvent::Status {
                status: JobStatus::Running,
                timestamp: now,
            });
            slot.record.job.clone()
        };

        self.persist_job(&job).await;
        Ok(job)
    }

    /// Append one line to the job's output and publish it. Terminal jobs
    /// accept no more output.
    pub async fn append_output(
        &self,
        job_id: Uuid,
        stream: OutputStream,
        text: impl Into<Arc<str>>,
    ) -> Result<OutputLine, DjrError> {
        let line = {
            let mut jobs = self.jobs.write().await;
            let slot = slot_mut(&mut jobs, job_id)?;
            if slot.record.job.status.is_terminal() {
                return Err(DjrError::Conflict(format!(
                    "Job {} is {}, output is closed",
                    job_id, slot.record.job.status
                )));
            }

            let line = OutputLine {
                seq: slot.record.output.len() as u64,
                stream,
                text: text.into(),
                timestamp: Utc::now(),
            };
            slot.record.output.push(line.clone());
            slot.publish(JobEvent::Output(line.clone()));
            line
        };

        if let Err(e) = self.store.append_output(job_id, &line).await {
            tracing::error!("Failed to persist output for job {}: {}", job_id, e);
        }
        Ok(line)
    }

    /// Bump the download/skip counters.
    pub async fn add_counts(
        &self,
        job_id: Uuid,
        downloads: u64,
        skips: u64,
    ) -> Result<Job, DjrError> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let slot = slot_mut(&mut jobs, job_id)?;
            if downloads == 0 && skips == 0 {
                return Ok(slot.record.job.clone());
            }
            slot.record.job.download_count += downloads;
            slot.record.job.skip_count += skips;
            slot.publish(JobEvent::counts(&slot.record.job));
            slot.record.job.clone()
        };

        self.persist_job(&job).await;
        Ok(job)
    }

    /// Move a job to a terminal status, publish `Finished` and close its live
    /// channel.
    pub async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<Job, DjrError> {
        if !status.is_terminal() {
            return Err(DjrError::Internal(format!(
                "{} is not a terminal status",
                status
            )));
        }

        let job = {
            let mut jobs = self.jobs.write().await;
            let slot = slot_mut(&mut jobs, job_id)?;
            check_transition(&slot.record.job, status)?;

            slot.record.job.status = status;
            slot.record.job.exit_code = exit_code;
            slot.record.job.error = error;
            slot.record.job.finished_at = Some(Utc::now());
            slot.publish(JobEvent::finished(&slot.record.job));
            slot.events = None;
            slot.record.job.clone()
        };

        tracing::info!(
            "Job {} finished: {} (exit code {:?})",
            job_id,
            status,
            exit_code
        );
        self.persist_job(&job).await;
        Ok(job)
    }

    /// The process could not be started: record why and fail the job without
    /// it ever entering `running`.
    pub async fn fail_to_start(&self, job_id: Uuid, error: &str) -> Result<Job, DjrError> {
        self.append_output(job_id, OutputStream::Error, error).await?;
        self.finish(job_id, JobStatus::Failed, None, Some(error.to_string()))
            .await
    }

    /// Forget a job and delete its stored record. Live subscribers see their
    /// stream end.
    pub async fn remove(&self, job_id: Uuid) -> Result<JobRecord, DjrError> {
        let slot = self
            .jobs
            .write()
            .await
            .remove(&job_id)
            .ok_or_else(|| DjrError::NotFound(format!("Job {}", job_id)))?;

        self.store
            .delete_job(job_id)
            .await
            .map_err(|e| DjrError::Storage(format!("Failed to delete job {}: {}", job_id, e)))?;

        tracing::info!("Deleted job {}", job_id);
        Ok(slot.record)
    }

    pub async fn subscribe(self: &Arc<Self>, job_id: Uuid) -> Result<Subscription, DjrError> {
        let source: Arc<dyn ReplaySource> = self.clone();
        Subscription::open(source, job_id).await
    }

    async fn persist_job(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            tracing::error!("Failed to persist job {}: {}", job.id, e);
        }
    }
}

#[async_trait]
impl ReplaySource for JobRegistry {
    async fn attach(&self, job_id: Uuid, from_seq: u64) -> Result<Attachment, DjrError> {
        let jobs = self.jobs.read().await;
        let slot = jobs
            .get(&job_id)
            .ok_or_else(|| DjrError::NotFound(format!("Job {}", job_id)))?;
        let job = &slot.record.job;

        let mut backlog = Vec::new();
        // A reattach resumes mid-stream and has already seen the status.
        if from_seq == 0 && !job.status.is_terminal() {
            backlog.push(JobEvent::Status {
                status: job.status,
                timestamp: job.started_at.unwrap_or(job.created_at),
            });
        }
        backlog.extend(
            slot.record
                .output
                .iter()
                .skip(from_seq as usize)
                .cloned()
                .map(JobEvent::Output),
        );
        if job.download_count > 0 || job.skip_count > 0 {
            backlog.push(JobEvent::counts(job));
        }
        if job.status.is_terminal() {
            backlog.push(JobEvent::finished(job));
        }

        Ok(Attachment {
            backlog,
            live: slot.events.as_ref().map(|tx| tx.subscribe()),
        })
    }
}

fn slot_mut(jobs: &mut HashMap<Uuid, JobSlot>, job_id: Uuid) -> Result<&mut JobSlot, DjrError> {
    jobs.get_mut(&job_id)
        .ok_or_else(|| DjrError::NotFound(format!("Job {}", job_id)))
}

fn check_transition(job: &Job, next: JobStatus) -> Result<(), DjrError> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(DjrError::Conflict(format!(
            "Job {} is {}, cannot become {}",
            job.id, job.status, next
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryJobStore;

    fn new_job(url: &str) -> NewJob {
        NewJob {
            urls: vec![url.to_string()],
            args: vec![url.to_string()],
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<JobRegistry>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let registry = JobRegistry::open(store.clone(), 64).await.expect("open");
        (Arc::new(registry), store)
    }

    fn output_texts(events: &[JobEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Output(line) => Some(line.text.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_persists_pending_job() {
        let (registry, store) = setup().await;
        let job = registry
            .create(new_job("https://example.com/a"))
            .await
            .expect("create");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(store.snapshot(job.id).await.is_some());
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_output_sequence_is_dense_and_persisted() {
        let (registry, store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        registry.mark_running(job.id).await.expect("running");
        for text in ["one", "two", "three"] {
            registry
                .append_output(job.id, OutputStream::Stdout, text)
                .await
                .expect("append");
        }

        let record = registry.get(job.id).await.expect("record");
        let seqs: Vec<u64> = record.output.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(store.snapshot(job.id).await.expect("stored").output.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (registry, _store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");

        let err = registry
            .finish(job.id, JobStatus::Completed, Some(0), None)
            .await
            .expect_err("pending cannot complete");
        assert!(matches!(err, DjrError::Conflict(_)));

        registry.mark_running(job.id).await.expect("running");
        assert!(registry.mark_running(job.id).await.is_err());

        registry
            .finish(job.id, JobStatus::Completed, Some(0), None)
            .await
            .expect("complete");
        assert!(registry
            .finish(job.id, JobStatus::Failed, Some(1), None)
            .await
            .is_err());
        assert!(registry
            .append_output(job.id, OutputStream::Stdout, "late")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fail_to_start_skips_running() {
        let (registry, _store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        let failed = registry
            .fail_to_start(job.id, "Failed to spawn process: not found")
            .await
            .expect("fail");
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.started_at.is_none());

        let record = registry.get(job.id).await.expect("record");
        assert_eq!(record.output.len(), 1);
        assert_eq!(record.output[0].stream, OutputStream::Error);
        assert!(record.output[0].text.contains("not found"));
    }

    #[tokio::test]
    async fn test_subscriber_sees_history_then_live_then_finished() {
        let (registry, _store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        registry.mark_running(job.id).await.expect("running");
        registry
            .append_output(job.id, OutputStream::Stdout, "before")
            .await
            .expect("append");

        let mut sub = registry.subscribe(job.id).await.expect("subscribe");

        registry
            .append_output(job.id, OutputStream::Stderr, "after")
            .await
            .expect("append");
        registry
            .finish(job.id, JobStatus::Completed, Some(0), None)
            .await
            .expect("finish");

        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        assert_eq!(output_texts(&events), vec!["before", "after"]);
        let finished: Vec<&JobEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(finished.len(), 1);
        assert!(matches!(
            finished[0],
            JobEvent::Finished {
                status: JobStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_subscribe_to_terminal_job_replays_and_closes() {
        let (registry, _store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        registry.mark_running(job.id).await.expect("running");
        registry
            .append_output(job.id, OutputStream::Stdout, "only line")
            .await
            .expect("append");
        registry
            .finish(job.id, JobStatus::Failed, Some(2), Some("exit 2".into()))
            .await
            .expect("finish");

        let sub = registry.subscribe(job.id).await.expect("subscribe");
        let events: Vec<JobEvent> = futures_util::StreamExt::collect(sub.into_stream()).await;
        assert_eq!(output_texts(&events), vec!["only line"]);
        assert!(events.last().expect("last").is_terminal());
    }

    #[tokio::test]
    async fn test_slow_subscriber_receives_every_line() {
        let store = Arc::new(MemoryJobStore::new());
        let registry = Arc::new(JobRegistry::open(store, 4).await.expect("open"));
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        registry.mark_running(job.id).await.expect("running");

        let mut sub = registry.subscribe(job.id).await.expect("subscribe");
        for i in 0..50 {
            registry
                .append_output(job.id, OutputStream::Stdout, format!("line {}", i))
                .await
                .expect("append");
        }
        registry
            .finish(job.id, JobStatus::Completed, Some(0), None)
            .await
            .expect("finish");

        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        let expected: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
        assert_eq!(output_texts(&events), expected);
        let statuses = events
            .iter()
            .filter(|e| matches!(e, JobEvent::Status { .. }))
            .count();
        assert_eq!(statuses, 1);
    }

    #[tokio::test]
    async fn test_attach_mid_stream_skips_status() {
        let (registry, _store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        registry.mark_running(job.id).await.expect("running");
        for text in ["one", "two", "three"] {
            registry
                .append_output(job.id, OutputStream::Stdout, text)
                .await
                .expect("append");
        }

        let fresh = registry.attach(job.id, 0).await.expect("attach");
        assert!(matches!(
            fresh.backlog.first(),
            Some(JobEvent::Status {
                status: JobStatus::Running,
                ..
            })
        ));

        let resumed = registry.attach(job.id, 2).await.expect("attach");
        assert!(!resumed
            .backlog
            .iter()
            .any(|e| matches!(e, JobEvent::Status { .. })));
        assert_eq!(output_texts(&resumed.backlog), vec!["three"]);
    }

    #[tokio::test]
    async fn test_remove_ends_live_subscription() {
        let (registry, store) = setup().await;
        let job = registry.create(new_job("https://a.com")).await.expect("create");
        let mut sub = registry.subscribe(job.id).await.expect("subscribe");

        registry.remove(job.id).await.expect("remove");
        assert!(registry.get(job.id).await.is_none());
        assert!(store.snapshot(job.id).await.is_none());

        // Pending status from the replay, then the closed channel ends it.
        assert!(matches!(sub.next().await, Some(JobEvent::Status { .. })));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_job_not_found() {
        let (registry, _store) = setup().await;
        let err = registry.remove(Uuid::now_v7()).await.expect_err("missing");
        assert!(matches!(err, DjrError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_marks_interrupted_jobs_failed() {
        let mut running = new_job("https://a.com").into_job();
        running.status = JobStatus::Running;
        running.started_at = Some(Utc::now());
        let mut done = new_job("https://b.com").into_job();
        done.status = JobStatus::Completed;
        done.exit_code = Some(0);

        let store = Arc::new(MemoryJobStore::with_records(vec![
            JobRecord {
                job: running.clone(),
                output: Vec::new(),
            },
            JobRecord {
                job: done.clone(),
                output: Vec::new(),
            },
        ]));
        let registry = JobRegistry::open(store.clone(), 16).await.expect("open");

        let record = registry.get(running.id).await.expect("record");
        assert_eq!(record.job.status, JobStatus::Failed);
        assert_eq!(record.job.error.as_deref(), Some(RESTART_INTERRUPTED));
        assert_eq!(&*record.output[0].text, RESTART_INTERRUPTED);
        assert_eq!(
            store.snapshot(running.id).await.expect("stored").job.status,
            JobStatus::Failed
        );
        assert_eq!(
            registry.status(done.id).await,
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_counts_and_stats() {
        let (registry, _store) = setup().await;
        let a = registry.create(new_job("https://a.com")).await.expect("create");
        registry.create(new_job("https://b.com")).await.expect("create");
        registry.mark_running(a.id).await.expect("running");

        let job = registry.add_counts(a.id, 2, 1).await.expect("counts");
        assert_eq!((job.download_count, job.skip_count), (2, 1));

        let stats = registry.stats().await;
        assert_eq!(
            stats,
            RegistryStats {
                total: 2,
                pending: 1,
                running: 1
            }
        );
    }
}
