//! Per-job event subscriptions.
//!
//! A [`Subscription`] first replays what the job has already produced, then
//! follows live events. Output lines carry a dense `seq`, so a subscriber that
//! falls behind the live channel re-attaches from the last line it delivered
//! and never skips or repeats a line.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::daemon::events::JobEvent;
use crate::errors::DjrError;

/// Snapshot of a job's history plus a receiver for everything after it.
///
/// Producers must take the snapshot and create the receiver atomically with
/// respect to publishing, otherwise events can fall between the two.
pub struct Attachment {
    pub backlog: Vec<JobEvent>,
    /// `None` once the job is terminal: there is nothing left to follow.
    pub live: Option<broadcast::Receiver<JobEvent>>,
}

/// Something that can hand out attachments, i.e. the job registry.
#[async_trait]
pub trait ReplaySource: Send + Sync {
    /// Attach to `job_id`, replaying output from `from_seq` onward.
    async fn attach(&self, job_id: Uuid, from_seq: u64) -> Result<Attachment, DjrError>;
}

pub struct Subscription {
    job_id: Uuid,
    source: Arc<dyn ReplaySource>,
    backlog: VecDeque<JobEvent>,
    live: Option<broadcast::Receiver<JobEvent>>,
    next_seq: u64,
    finished: bool,
}

impl Subscription {
    pub async fn open(source: Arc<dyn ReplaySource>, job_id: Uuid) -> Result<Self, DjrError> {
        let attachment = source.attach(job_id, 0).await?;
        tracing::debug!("Subscribed to job {}", job_id);
        Ok(Self {
            job_id,
            source,
            backlog: attachment.backlog.into(),
            live: attachment.live,
            next_seq: 0,
            finished: false,
        })
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event, or `None` once the job has finished (after its `Finished`
    /// event was delivered) or was deleted.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
                continue;
            }

            let live = self.live.as_mut()?;
            match live.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Subscriber of job {} lagged by {} events, replaying from line {}",
                        self.job_id,
                        skipped,
                        self.next_seq
                    );
                    self.reattach().await;
                }
                Err(RecvError::Closed) => {
                    // The job was removed while we were following it.
                    self.live = None;
                }
            }
        }
    }

    /// Stop receiving events. Dropping the subscription has the same effect.
    pub fn unsubscribe(self) {
        tracing::debug!("Unsubscribed from job {}", self.job_id);
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }

    /// Drop duplicate output lines and remember where we are.
    fn accept(&mut self, event: JobEvent) -> Option<JobEvent> {
        match &event {
            JobEvent::Output(line) => {
                if line.seq < self.next_seq {
                    return None;
                }
                self.next_seq = line.seq + 1;
            }
            JobEvent::Finished { .. } => {
                self.finished = true;
                self.live = None;
            }
            _ => {}
        }
        Some(event)
    }

    async fn reattach(&mut self) {
        match self.source.attach(self.job_id, self.next_seq).await {
            Ok(attachment) => {
                self.backlog = attachment.backlog.into();
                self.live = attachment.live;
            }
            Err(e) => {
                tracing::debug!("Job {} is gone, ending subscription: {}", self.job_id, e);
                self.backlog.clear();
                self.live = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, OutputLine, OutputStream};
    use chrono::Utc;
    use futures_util::StreamExt;
    use tokio::sync::Mutex;

    fn output(seq: u64) -> JobEvent {
        JobEvent::Output(OutputLine {
            seq,
            stream: OutputStream::Stdout,
            text: Arc::from(format!("line {}", seq)),
            timestamp: Utc::now(),
        })
    }

    fn finished() -> JobEvent {
        JobEvent::Finished {
            status: JobStatus::Completed,
            exit_code: Some(0),
            error: None,
            download_count: 0,
            skip_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// In-memory source: a history of output lines and one live channel.
    struct FakeSource {
        history: Mutex<Vec<JobEvent>>,
        tx: Mutex<Option<broadcast::Sender<JobEvent>>>,
    }

    impl FakeSource {
        fn new(capacity: usize) -> Arc<Self> {
            let (tx, _) = broadcast::channel(capacity);
            Arc::new(Self {
                history: Mutex::new(Vec::new()),
                tx: Mutex::new(Some(tx)),
            })
        }

        async fn publish(&self, event: JobEvent) {
            self.history.lock().await.push(event.clone());
            if let Some(tx) = self.tx.lock().await.as_ref() {
                let _ = tx.send(event);
            }
        }

        async fn close(&self) {
            self.tx.lock().await.take();
        }

        async fn receiver_count(&self) -> usize {
            self.tx
                .lock()
                .await
                .as_ref()
                .map(|tx| tx.receiver_count())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl ReplaySource for FakeSource {
        async fn attach(&self, _job_id: Uuid, from_seq: u64) -> Result<Attachment, DjrError> {
            let history = self.history.lock().await;
            let tx = self.tx.lock().await;
            let backlog = history
                .iter()
                .filter(|e| match e {
                    JobEvent::Output(line) => line.seq >= from_seq,
                    _ => true,
                })
                .cloned()
                .collect();
            let live = tx.as_ref().map(|tx| tx.subscribe());
            Ok(Attachment { backlog, live })
        }
    }

    fn seqs(events: &[JobEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Output(line) => Some(line.seq),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replay_then_live_then_finished() {
        let source = FakeSource::new(16);
        source.publish(output(0)).await;
        source.publish(output(1)).await;

        let sub = Subscription::open(source.clone(), Uuid::now_v7())
            .await
            .expect("open");

        source.publish(output(2)).await;
        source.publish(finished()).await;
        source.close().await;

        let events: Vec<JobEvent> = sub.into_stream().collect().await;
        assert_eq!(seqs(&events), vec![0, 1, 2]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().expect("last").is_terminal());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_backfills_without_gaps() {
        let source = FakeSource::new(2);
        let mut sub = Subscription::open(source.clone(), Uuid::now_v7())
            .await
            .expect("open");

        for seq in 0..10 {
            source.publish(output(seq)).await;
        }
        source.publish(finished()).await;

        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        assert_eq!(seqs(&events), (0..10).collect::<Vec<_>>());
        assert!(events.last().expect("last").is_terminal());
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let source = FakeSource::new(4);
        let mut sub = Subscription::open(source.clone(), Uuid::now_v7())
            .await
            .expect("open");
        source.publish(output(0)).await;
        source.close().await;

        assert!(matches!(sub.next().await, Some(JobEvent::Output(_))));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_receiver() {
        let source = FakeSource::new(4);
        let sub = Subscription::open(source.clone(), Uuid::now_v7())
            .await
            .expect("open");
        assert_eq!(source.receiver_count().await, 1);
        sub.unsubscribe();
        assert_eq!(source.receiver_count().await, 0);
    }
}
