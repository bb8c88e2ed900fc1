// Daemon module: job engine plus the process bootstrap around it.

pub mod events;
pub mod hub;
pub mod orchestrator;
pub mod registry;
pub mod supervisor;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;

use crate::daemon::orchestrator::Orchestrator;
use crate::daemon::registry::JobRegistry;
use crate::daemon::supervisor::Supervisor;
use crate::models::ServerConfig;
use crate::options::OptionCatalog;
use crate::process::{ProcessSpawner, TokioSpawner};
use crate::server::{self, AppState};
use crate::sites::SiteResolver;
use crate::storage::site_rules::{JsonSiteRuleStore, StaticSiteRules};
use crate::storage::{JobStore, SiteRuleStore};

// ---------------------------------------------------------------------------
// PidFile
// ---------------------------------------------------------------------------

/// Keeps a second server from running against the same data directory.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create the PID file exclusively. A file left by a dead process is
    /// replaced; one held by a live process is an error.
    pub fn acquire(&self) -> Result<()> {
        if self.path.exists() {
            let content =
                std::fs::read_to_string(&self.path).context("Failed to read existing PID file")?;
            let existing_pid: u32 = content
                .trim()
                .parse()
                .context("Failed to parse PID from PID file")?;

            if is_process_alive(existing_pid) {
                return Err(anyhow::anyhow!(
                    "Server is already running (PID {existing_pid}). PID file: {}",
                    self.path.display()
                ));
            }

            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing_pid
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file (exclusive create)")?;

        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID to PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a process with the given PID exists.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 only checks for existence.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        // Without a cheap liveness probe, treat any recorded PID as stale.
        let _ = pid;
        false
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path, source: &str) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", source))?;
    let config: ServerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", source))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the server config. First hit wins:
///   1. `--config` flag (must exist)
///   2. `DJR_CONFIG_DIR/config.json`
///   3. platform config dir `download-job-runner/config.json`
///   4. `{data_dir}/config.json`
///   5. defaults
pub fn load_config(config_path: Option<&Path>) -> Result<ServerConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path, "config file");
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("DJR_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path, "DJR_CONFIG_DIR");
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("download-job-runner").join("config.json");
        if path.exists() {
            return read_config(&path, "platform config dir");
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path, "data dir");
    }

    tracing::info!("No config file found, using defaults");
    Ok(ServerConfig::default())
}

/// Resolve the data directory: explicit override, then `DJR_DATA_DIR`, then
/// the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("DJR_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("download-job-runner")
}

pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("jobs"))
        .await
        .context("Failed to create data directory")?;
    tracing::info!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber: stderr always, plus `djr.log` in the data
/// directory when `log_dir` is given. Keep the returned guard alive for as
/// long as file logging should be flushed.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        return None;
    };

    let appender = tracing_appender::rolling::never(dir, "djr.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => {
            tracing::info!("Logging to stderr and {}", dir.join("djr.log").display());
            Some(guard)
        }
        // Someone else (a test harness) already installed a subscriber.
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load_catalog(config: &ServerConfig) -> Result<OptionCatalog> {
    match config.options_file {
        Some(ref path) => OptionCatalog::load(path),
        None => Ok(OptionCatalog::builtin()),
    }
}

fn site_rule_store(config: &ServerConfig) -> Arc<dyn SiteRuleStore> {
    match config.site_rules_path() {
        Some(path) => {
            tracing::info!("Reading site rules from {}", path.display());
            Arc::new(JsonSiteRuleStore::new(path))
        }
        None => Arc::new(StaticSiteRules::default()),
    }
}

/// Build the job engine and the shared HTTP state on top of a job store and a
/// process spawner.
pub async fn build_state(
    config: Arc<ServerConfig>,
    job_store: Arc<dyn JobStore>,
    spawner: Arc<dyn ProcessSpawner>,
) -> Result<Arc<AppState>> {
    let catalog = Arc::new(load_catalog(&config)?);
    let resolver = SiteResolver::new(site_rule_store(&config));

    let registry = Arc::new(
        JobRegistry::open(job_store, config.event_capacity)
            .await
            .context("Failed to load jobs")?,
    );
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&registry),
        spawner,
        Arc::clone(&config),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        resolver,
        catalog,
        Arc::clone(&config),
    ));

    Ok(Arc::new(AppState {
        registry,
        supervisor,
        orchestrator,
        config,
        start_time: Instant::now(),
    }))
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Cancel every running job, then release the PID file.
pub async fn graceful_shutdown(supervisor: &Supervisor, pid_file: Option<&PidFile>) {
    tracing::info!("Beginning graceful shutdown sequence...");

    let active = supervisor.active_jobs().await;
    if !active.is_empty() {
        tracing::info!("Cancelling {} running job(s)", active.len());
    }
    supervisor.cancel_all().await;

    if let Some(pf) = pid_file {
        if let Err(e) = pf.release() {
            tracing::error!("Failed to release PID file: {}", e);
        }
    }

    tracing::info!("Graceful shutdown complete.");
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

/// Flags of `djr serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Keep jobs in memory only.
    pub ephemeral: bool,
    pub verbose: bool,
}

/// Run the server until Ctrl+C or SIGTERM.
pub async fn start_server(opts: ServeOptions) -> Result<()> {
    let mut config = load_config(opts.config_path.as_deref())?;

    if let Some(ref h) = opts.host {
        config.host = h.clone();
    }
    if let Some(p) = opts.port {
        config.port = p;
    }

    let data_dir = match (&opts.data_dir, &config.data_dir) {
        (Some(d), _) => d.clone(),
        (None, Some(d)) => d.clone(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir.clone());
    let config = Arc::new(config);

    create_data_dirs(&data_dir).await?;
    let _log_guard = init_logging(Some(&data_dir), opts.verbose);
    tracing::info!("Data directory: {}", data_dir.display());

    let pid_file = PidFile::new(data_dir.join("djr.pid"));
    pid_file.acquire()?;

    let job_store: Arc<dyn JobStore> = if opts.ephemeral {
        tracing::info!("Ephemeral mode: jobs are kept in memory only");
        Arc::new(crate::storage::memory::MemoryJobStore::new())
    } else {
        Arc::new(crate::storage::jobs::FsJobStore::new(data_dir.clone()).await?)
    };

    let state = match build_state(Arc::clone(&config), job_store, Arc::new(TokioSpawner)).await {
        Ok(state) => state,
        Err(e) => {
            let _ = pid_file.release();
            return Err(e);
        }
    };
    tracing::info!(
        "Downloader: {}",
        config.downloader_path().display()
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());

    let router = server::create_router(Arc::clone(&state));
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = pid_file.release();
            return Err(e).context(format!("Failed to bind to {}", bind_addr));
        }
    };

    tracing::info!("Server started. Listening on http://{}", bind_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
            .ok();
    });

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received Ctrl+C signal");
    }

    // Cancel jobs first so open SSE streams see their final events and end.
    graceful_shutdown(&state.supervisor, Some(&pid_file)).await;
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    tracing::info!("Server exited cleanly.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, NewJob};
    use crate::process::{MockBehavior, MockSpawner};
    use crate::storage::memory::MemoryJobStore;
    use tempfile::TempDir;

    #[test]
    fn test_pidfile_acquire_creates_file() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("djr.pid");

        let pid_file = PidFile::new(pid_path.clone());
        pid_file.acquire().expect("acquire should succeed");

        let content = std::fs::read_to_string(&pid_path).expect("read PID file");
        let written_pid: u32 = content.trim().parse().expect("parse PID");
        assert_eq!(written_pid, std::process::id());

        pid_file.release().expect("release");
        assert!(!pid_path.exists(), "PID file should be gone after release");
    }

    #[cfg(unix)]
    #[test]
    fn test_pidfile_acquire_fails_if_held_by_live_process() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("djr.pid");
        std::fs::write(&pid_path, format!("{}", std::process::id())).expect("write PID file");

        let err = PidFile::new(pid_path)
            .acquire()
            .expect_err("live PID must block acquire");
        assert!(err.to_string().contains("already running"), "got: {}", err);
    }

    #[test]
    fn test_pidfile_replaces_stale_file() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let pid_path = tmp_dir.path().join("djr.pid");
        std::fs::write(&pid_path, "4000000").expect("write stale PID file");

        let pid_file = PidFile::new(pid_path.clone());
        pid_file.acquire().expect("stale PID file is replaced");
        let content = std::fs::read_to_string(&pid_path).expect("read PID file");
        assert_eq!(content.trim(), std::process::id().to_string());
        pid_file.release().expect("release");
    }

    #[test]
    fn test_load_config_explicit_path() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let path = tmp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "group_batches": false}"#).expect("write");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.port, 9000);
        assert!(!config.group_batches);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_load_config_missing_explicit_path_fails() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let err = load_config(Some(&tmp_dir.path().join("nope.json"))).expect_err("missing");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_config_invalid_json_fails() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let path = tmp_dir.path().join("config.json");
        std::fs::write(&path, "{ nope").expect("write");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_resolve_data_dir_override_wins() {
        let dir = PathBuf::from("/tmp/djr-test-data");
        assert_eq!(resolve_data_dir(Some(&dir)), dir);
    }

    #[tokio::test]
    async fn test_create_data_dirs() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let data_dir = tmp_dir.path().join("data");
        create_data_dirs(&data_dir).await.expect("create");
        assert!(data_dir.join("jobs").is_dir());
    }

    #[tokio::test]
    async fn test_build_state_with_missing_catalog_fails() {
        let config = Arc::new(ServerConfig {
            options_file: Some(PathBuf::from("/nonexistent/options.json")),
            ..Default::default()
        });
        let result = build_state(
            config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MockSpawner::with_output_and_exit(&[], 0)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_cancels_running_jobs() {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let config = Arc::new(ServerConfig {
            data_dir: Some(tmp_dir.path().to_path_buf()),
            cancel_grace_secs: 1,
            kill_timeout_secs: 1,
            ..Default::default()
        });
        let state = build_state(
            config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(MockSpawner::running(&["busy"], MockBehavior::RunUntilKilled)),
        )
        .await
        .expect("state");

        let job = state
            .registry
            .create(NewJob {
                urls: vec!["https://example.com/a".to_string()],
                args: vec!["https://example.com/a".to_string()],
                ..Default::default()
            })
            .await
            .expect("create");
        state.supervisor.start(job.id).await.expect("start");

        let pid_file = PidFile::new(tmp_dir.path().join("djr.pid"));
        pid_file.acquire().expect("acquire");

        graceful_shutdown(&state.supervisor, Some(&pid_file)).await;

        assert_eq!(
            state.registry.status(job.id).await,
            Some(JobStatus::Cancelled)
        );
        assert!(state.supervisor.active_jobs().await.is_empty());
        assert!(!pid_file.path().exists());
    }
}
