// Process abstraction for the external downloader, with real and mock
// implementations. The supervisor only ever talks to these traits.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};

/// A captured output pipe of a spawned process.
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// Trait for launching the downloader.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String]) -> anyhow::Result<Box<dyn ChildProcess>>;
}

/// Trait for interacting with a spawned process.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;
    fn take_stdout(&mut self) -> Option<OutputPipe>;
    fn take_stderr(&mut self) -> Option<OutputPipe>;
    /// Politely ask the process to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> io::Result<()>;
    /// Forcefully stop the process.
    async fn kill(&mut self) -> io::Result<()>;
    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

// --- Real implementation using tokio::process ---

/// Spawns the downloader with piped stdout/stderr and a null stdin.
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, program: &Path, args: &[String]) -> anyhow::Result<Box<dyn ChildProcess>> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("{}: {}", program.display(), e))?;
        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputPipe)
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                // Already reaped.
                return Ok(());
            };
            // SAFETY: plain syscall on a pid we own; no memory is shared.
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

// --- Mock implementation for testing ---

/// How a mock process reacts once its scripted output is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Close its pipes and exit with the configured code.
    #[default]
    Exit,
    /// Keep its pipes open until terminated or killed.
    RunUntilKilled,
    /// Like `RunUntilKilled`, but only a forceful kill stops it.
    IgnoreTerminate,
    /// Nothing stops it.
    Unkillable,
}

/// Script for a mock process.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub spawn_error: Option<String>,
    pub behavior: MockBehavior,
}

/// Mock spawner that replays a [`MockScript`] and records every invocation.
#[derive(Clone)]
pub struct MockSpawner {
    script: Arc<Mutex<MockScript>>,
    invocations: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockSpawner {
    pub fn new(script: MockScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Print the given stdout lines, then exit with `exit_code`.
    pub fn with_output_and_exit(stdout: &[&str], exit_code: i32) -> Self {
        Self::new(MockScript {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            exit_code,
            ..Default::default()
        })
    }

    pub fn with_spawn_error(error: &str) -> Self {
        Self::new(MockScript {
            spawn_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    pub fn running(stdout: &[&str], behavior: MockBehavior) -> Self {
        Self::new(MockScript {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            behavior,
            ..Default::default()
        })
    }

    /// Every `[program, args...]` passed to `spawn` so far.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, program: &Path, args: &[String]) -> anyhow::Result<Box<dyn ChildProcess>> {
        let script = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut argv = vec![program.display().to_string()];
        argv.extend(args.iter().cloned());
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(argv);

        if let Some(error) = script.spawn_error {
            return Err(anyhow::anyhow!(error));
        }

        let scripted = |lines: &[String]| -> Vec<u8> {
            lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect()
        };
        let stdout_bytes = scripted(&script.stdout);
        let stderr_bytes = scripted(&script.stderr);

        let (stdout, stderr, held) = if script.behavior == MockBehavior::Exit {
            (
                Box::new(io::Cursor::new(stdout_bytes)) as OutputPipe,
                Box::new(io::Cursor::new(stderr_bytes)) as OutputPipe,
                None,
            )
        } else {
            // The write halves stay with the mock child; the pipes reach EOF
            // only once they are dropped.
            let (out_write, out_read) = tokio::io::duplex(64);
            let (err_write, err_read) = tokio::io::duplex(64);
            (
                Box::new(io::Cursor::new(stdout_bytes).chain(out_read)) as OutputPipe,
                Box::new(io::Cursor::new(stderr_bytes).chain(err_read)) as OutputPipe,
                Some((out_write, err_write)),
            )
        };

        Ok(Box::new(MockChild {
            stdout: Some(stdout),
            stderr: Some(stderr),
            held,
            exit_code: script.exit_code,
            behavior: script.behavior,
        }))
    }
}

struct MockChild {
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    held: Option<(DuplexStream, DuplexStream)>,
    exit_code: i32,
    behavior: MockBehavior,
}

#[async_trait]
impl ChildProcess for MockChild {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr.take()
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.behavior == MockBehavior::RunUntilKilled && self.held.take().is_some() {
            self.exit_code = 143;
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.behavior != MockBehavior::Unkillable && self.held.take().is_some() {
            self.exit_code = 137;
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        if self.held.is_some() {
            std::future::pending::<()>().await;
        }
        Ok(exit_status_from_code(self.exit_code))
    }
}

/// Helper to create an ExitStatus from a raw exit code.
pub fn exit_status_from_code(code: i32) -> ExitStatus {
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(code as u32)
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }
}
