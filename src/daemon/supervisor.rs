use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::daemon::registry::JobRegistry;
use crate::errors::DjrError;
use crate::models::{JobStatus, OutputStream, ServerConfig};
use crate::process::{ChildProcess, OutputPipe, ProcessSpawner};

/// Handle to a supervised process, allowing cancellation.
pub struct RunHandle {
    pub job_id: Uuid,
    pub join_handle: JoinHandle<Result<JobStatus, DjrError>>,
    pub cancel_tx: oneshot::Sender<()>,
}

type ActiveRuns = Arc<RwLock<HashMap<Uuid, RunHandle>>>;

/// What happened to a job's run when the job was removed.
#[derive(Debug)]
pub enum Removal {
    /// Nothing was running.
    Idle,
    /// The run was stopped and ended with this status.
    Stopped(JobStatus),
    /// The run could not be stopped; the record is gone regardless.
    StopFailed(DjrError),
}

/// How an output line affects the job's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Download,
    Skip,
    Other,
}

/// Remove ANSI escape sequences (`ESC [ ... <final>`) from a line.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // Parameters and intermediates, then one final byte in '@'..='~'.
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

/// The downloader prints `✔ <path>` for each file it fetched and `# <path>`
/// for each file it already had.
pub fn classify_line(text: &str) -> LineKind {
    let plain = strip_ansi(text);
    let plain = plain.trim_start();
    if plain.starts_with("✔ ") {
        LineKind::Download
    } else if plain.starts_with("# ") {
        LineKind::Skip
    } else {
        LineKind::Other
    }
}

/// Launches downloader processes and follows them to a terminal status.
pub struct Supervisor {
    registry: Arc<JobRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    config: Arc<ServerConfig>,
    active: ActiveRuns,
}

impl Supervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            spawner,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the process for a pending job.
    ///
    /// A spawn failure fails the job right away and is not an error of this
    /// call; the returned status tells the caller what happened.
    ///
    /// The run map stays locked from the status check until the run is
    /// registered, so `cancel` and `remove_job` never observe a running job
    /// without its handle.
    pub async fn start(&self, job_id: Uuid) -> Result<JobStatus, DjrError> {
        let mut active = self.active.write().await;

        let job = self
            .registry
            .get_job(job_id)
            .await
            .ok_or_else(|| DjrError::NotFound(format!("Job {}", job_id)))?;
        if job.status != JobStatus::Pending {
            return Err(DjrError::Conflict(format!(
                "Job {} is {}, only pending jobs can be started",
                job_id, job.status
            )));
        }

        let program = self.config.downloader_path();
        let mut child = match self.spawner.spawn(&program, &job.args) {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn process: {}", e);
                tracing::error!("Job {}: {}", job_id, error_msg);
                self.registry.fail_to_start(job_id, &error_msg).await?;
                return Ok(JobStatus::Failed);
            }
        };

        if let Err(e) = self.registry.mark_running(job_id).await {
            tracing::error!("Job {}: could not mark running, killing process: {}", job_id, e);
            if let Err(kill_err) = child.kill().await {
                tracing::warn!("Job {}: kill failed: {}", job_id, kill_err);
            }
            return Err(e);
        }
        if let Some(pid) = child.id() {
            tracing::info!("Job {} started with PID {}", job_id, pid);
            if let Err(e) = self
                .registry
                .append_output(
                    job_id,
                    OutputStream::Info,
                    format!("Process started with PID: {}", pid),
                )
                .await
            {
                tracing::warn!("Job {}: could not record PID line: {}", job_id, e);
            }
        }

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let run = Run {
            job_id,
            registry: Arc::clone(&self.registry),
            active: Arc::clone(&self.active),
            grace: self.config.cancel_grace(),
            kill_timeout: self.config.kill_timeout(),
        };

        let join_handle = tokio::spawn(run.supervise(child, stdout, stderr, cancel_rx));
        active.insert(
            job_id,
            RunHandle {
                job_id,
                join_handle,
                cancel_tx,
            },
        );

        Ok(JobStatus::Running)
    }

    /// Cancel a running job and wait until its process is gone.
    ///
    /// Returns the job's final status. Cancelling a job that is not running is
    /// a conflict; a process that survives termination and kill is a timeout.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus, DjrError> {
        let handle = self.active.write().await.remove(&job_id);
        let Some(handle) = handle else {
            return match self.registry.status(job_id).await {
                None => Err(DjrError::NotFound(format!("Job {}", job_id))),
                Some(status) => Err(DjrError::Conflict(format!(
                    "Job {} is {}, only running jobs can be cancelled",
                    job_id, status
                ))),
            };
        };
        self.stop_run(handle).await
    }

    /// Stop the job's run if it has one, then delete its record.
    ///
    /// Removal happens under the run map lock when nothing is running, so a
    /// concurrent `start` cannot launch a job that is being deleted.
    pub async fn remove_job(&self, job_id: Uuid) -> Result<Removal, DjrError> {
        let handle = {
            let mut active = self.active.write().await;
            match active.remove(&job_id) {
                Some(handle) => handle,
                None => {
                    self.registry.remove(job_id).await?;
                    return Ok(Removal::Idle);
                }
            }
        };

        let removal = match self.stop_run(handle).await {
            Ok(status) => Removal::Stopped(status),
            Err(e) => Removal::StopFailed(e),
        };
        self.registry.remove(job_id).await?;
        Ok(removal)
    }

    async fn stop_run(&self, handle: RunHandle) -> Result<JobStatus, DjrError> {
        let job_id = handle.job_id;
        tracing::info!("Cancelling job {}", job_id);
        // The task may already be past its select; it finishes on its own then.
        let _ = handle.cancel_tx.send(());

        let limit = self.config.cancel_grace() + self.config.kill_timeout() * 2 + Duration::from_secs(1);
        match tokio::time::timeout(limit, handle.join_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DjrError::Internal(format!(
                "Supervisor task for job {} failed: {}",
                job_id, join_err
            ))),
            Err(_) => Err(DjrError::Timeout(format!(
                "Job {} did not stop within {:?}",
                job_id, limit
            ))),
        }
    }

    pub async fn is_active(&self, job_id: Uuid) -> bool {
        self.active.read().await.contains_key(&job_id)
    }

    pub async fn active_jobs(&self) -> Vec<Uuid> {
        self.active.read().await.keys().copied().collect()
    }

    /// Cancel everything still running. Used on shutdown.
    pub async fn cancel_all(&self) {
        for job_id in self.active_jobs().await {
            if let Err(e) = self.cancel(job_id).await {
                tracing::warn!("Failed to cancel job {} during shutdown: {}", job_id, e);
            }
        }
    }
}

/// Everything the supervision task needs, detached from the supervisor.
struct Run {
    job_id: Uuid,
    registry: Arc<JobRegistry>,
    active: ActiveRuns,
    grace: Duration,
    kill_timeout: Duration,
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    Detached,
}

impl Run {
    async fn supervise(
        self,
        mut child: Box<dyn ChildProcess>,
        stdout: Option<OutputPipe>,
        stderr: Option<OutputPipe>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<JobStatus, DjrError> {
        let (line_tx, mut line_rx) = mpsc::channel::<(OutputStream, String)>(256);
        let mut readers = Vec::new();
        if let Some(pipe) = stdout {
            readers.push(tokio::spawn(read_lines(pipe, OutputStream::Stdout, line_tx.clone())));
        }
        if let Some(pipe) = stderr {
            readers.push(tokio::spawn(read_lines(pipe, OutputStream::Stderr, line_tx.clone())));
        }
        drop(line_tx);

        // Phase 1: capture output until both pipes close or a cancel arrives.
        let mut cancel_open = true;
        let mut cancelled = false;
        loop {
            tokio::select! {
                next = line_rx.recv() => match next {
                    Some((stream, text)) => self.record_line(stream, text).await,
                    None => break,
                },
                res = &mut cancel_rx, if cancel_open => {
                    cancel_open = false;
                    if res.is_ok() {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        // Phase 2: wait for the process, or stop it.
        let waited = if cancelled {
            Waited::Cancelled
        } else if cancel_open {
            tokio::select! {
                status = child.wait() => Waited::Exited(status),
                res = &mut cancel_rx => if res.is_ok() { Waited::Cancelled } else { Waited::Detached },
            }
        } else {
            Waited::Detached
        };
        let (cancelled, outcome) = match waited {
            Waited::Exited(status) => (false, status),
            Waited::Detached => (false, child.wait().await),
            Waited::Cancelled => (true, self.stop(child.as_mut()).await),
        };

        // Phase 3: whatever the pipes still hold belongs to the job.
        let drain = async {
            while let Some((stream, text)) = line_rx.recv().await {
                self.record_line(stream, text).await;
            }
        };
        if tokio::time::timeout(self.kill_timeout, drain).await.is_err() {
            tracing::warn!("Job {}: output pipes did not close, dropping them", self.job_id);
        }
        for reader in readers {
            reader.abort();
        }

        let result = self.conclude(cancelled, outcome).await;
        self.active.write().await.remove(&self.job_id);
        result
    }

    /// SIGTERM, then kill after the grace period.
    async fn stop(&self, child: &mut dyn ChildProcess) -> io::Result<ExitStatus> {
        if let Err(e) = child.terminate() {
            tracing::warn!("Job {}: failed to send terminate signal: {}", self.job_id, e);
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::warn!(
                    "Job {}: process still running after {:?}, killing",
                    self.job_id,
                    self.grace
                );
            }
        }

        child.kill().await?;
        match tokio::time::timeout(self.kill_timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "process did not exit after kill",
            )),
        }
    }

    async fn conclude(
        &self,
        cancelled: bool,
        outcome: io::Result<ExitStatus>,
    ) -> Result<JobStatus, DjrError> {
        let (status, exit_code, error) = match (cancelled, outcome) {
            (true, Ok(exit)) => (JobStatus::Cancelled, exit.code(), None),
            (true, Err(e)) => {
                let msg = format!("Process could not be stopped: {}", e);
                self.finish(JobStatus::Failed, None, Some(msg.clone())).await?;
                return Err(DjrError::Timeout(msg));
            }
            (false, Ok(exit)) if exit.success() => (JobStatus::Completed, Some(0), None),
            (false, Ok(exit)) => {
                let msg = match exit.code() {
                    Some(code) => format!("Process exited with code {}", code),
                    None => format!("Process terminated abnormally ({})", exit),
                };
                (JobStatus::Failed, exit.code(), Some(msg))
            }
            (false, Err(e)) => (
                JobStatus::Failed,
                None,
                Some(format!("Failed to wait for process: {}", e)),
            ),
        };

        self.finish(status, exit_code, error).await?;
        Ok(status)
    }

    async fn finish(
        &self,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<(), DjrError> {
        if let Some(ref msg) = error {
            if let Err(e) = self
                .registry
                .append_output(self.job_id, OutputStream::Error, msg.as_str())
                .await
            {
                tracing::warn!("Job {}: could not record error line: {}", self.job_id, e);
            }
        }
        self.registry
            .finish(self.job_id, status, exit_code, error)
            .await
            .map(|_| ())
    }

    async fn record_line(&self, stream: OutputStream, text: String) {
        let kind = classify_line(&text);
        if let Err(e) = self.registry.append_output(self.job_id, stream, text).await {
            tracing::warn!("Job {}: dropping output line: {}", self.job_id, e);
            return;
        }
        let (downloads, skips) = match kind {
            LineKind::Download => (1, 0),
            LineKind::Skip => (0, 1),
            LineKind::Other => return,
        };
        if let Err(e) = self.registry.add_counts(self.job_id, downloads, skips).await {
            tracing::warn!("Job {}: failed to update counts: {}", self.job_id, e);
        }
    }
}

/// Forward one pipe line by line. Bytes are decoded lossily; a trailing
/// `\r\n` is removed and carriage-return progress updates keep only their
/// last segment.
async fn read_lines(
    pipe: OutputPipe,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let trimmed = decoded.trim_end_matches(['\n', '\r']);
                let text = trimmed
                    .rsplit('\r')
                    .find(|segment| !segment.is_empty())
                    .unwrap_or("");
                if tx.send((stream, text.to_string())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Output pipe read error: {}", e);
                break;
            }
        }
    }
}
