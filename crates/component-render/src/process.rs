//! Process spawning abstraction
//!
//! The supervisor never touches `tokio::process` directly; it asks a
//! [`ProcessSpawner`] for an event stream and a handle. This keeps the start
//! state machine testable with scripted fakes:
//! - [`ShellProcessSpawner`] runs the dev-server command through `/bin/bash`
//! - tests provide spawners that replay canned output
//!
//! # Example
//!
//! ```rust,ignore
//! use component_render::process::{ProcessEvent, ProcessSpawner, ShellProcessSpawner, SpawnSpec};
//!
//! let spawner = ShellProcessSpawner::new();
//! let spec = SpawnSpec::new("npm run start", "/work/t-1").env("PORT", "3100");
//! let (mut rx, handle) = spawner.spawn(&spec).await?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         ProcessEvent::Stdout(data) => println!("stdout: {}", String::from_utf8_lossy(&data)),
//!         ProcessEvent::Terminated(_) => break,
//!         _ => {}
//!     }
//! }
//! handle.terminate()?;
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{paths, timeouts};

/// Output event from a spawned process
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Line written to stdout
    Stdout(Vec<u8>),
    /// Line written to stderr
    Stderr(Vec<u8>),
    /// Process error (e.g., failed to wait on the child)
    Error(String),
    /// Process terminated with optional exit code
    Terminated(Option<i32>),
}

/// Handle to a spawned process
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> u32;
    /// Ask the process to stop (SIGTERM)
    fn terminate(&self) -> Result<(), String>;
}

/// What to run and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Shell command line
    pub command: String,
    /// Working directory
    pub cwd: PathBuf,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment variable set for this command
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Trait for spawning external processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn a process
    ///
    /// # Returns
    /// A tuple of (event receiver, process handle). The receiver yields
    /// `Terminated` exactly once, after the output streams are drained.
    async fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String>;
}

// ============================================================================
// Shell Process Spawner
// ============================================================================

/// Handle to a shell spawned in its own process group
struct ShellProcessHandle {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle for ShellProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&self) -> Result<(), String> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Negative PID addresses the whole group, so the server the shell
        // launched receives the signal too
        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{}", self.pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("Failed to send SIGTERM: {}", e))?;

        if status.success() || self.exited.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(format!("kill -TERM exited with {} for group {}", status, self.pid))
        }
    }
}

/// Runs commands through a shell with `PATH` extended by the common system
/// binary directories
pub struct ShellProcessSpawner {
    shell: PathBuf,
    extra_path: String,
    output_drain: Duration,
}

impl Default for ShellProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellProcessSpawner {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            extra_path: paths::EXTRA_PATH.to_string(),
            output_drain: Duration::from_millis(timeouts::OUTPUT_DRAIN_MS),
        }
    }

    pub fn with_shell(mut self, shell: PathBuf) -> Self {
        self.shell = shell;
        self
    }

    fn search_path(&self) -> String {
        match std::env::var("PATH") {
            Ok(path) if !path.is_empty() => format!("{}:{}", path, self.extra_path),
            _ => self.extra_path.clone(),
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn spawn_line_reader<R>(
    stream: R,
    tx: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Raw bytes: dev servers print non-UTF-8 output and the pipe must stay open
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = trim_line_ending(&buf).to_vec();
            if tx.send(wrap(line)).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl ProcessSpawner for ShellProcessSpawner {
    async fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("PATH", self.search_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| format!("Failed to spawn `{}`: {}", spec.command, e))?;

        let pid = child
            .id()
            .ok_or_else(|| format!("`{}` exited before its PID was read", spec.command))?;

        let (tx, rx) = mpsc::channel(256);
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone(), ProcessEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone(), ProcessEvent::Stderr));
        }

        // Process monitor
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = exited.clone();
        let drain = self.output_drain;
        tokio::spawn(async move {
            let status = child.wait().await;
            exited_flag.store(true, Ordering::SeqCst);

            // Lines still buffered in the pipes belong before the exit event.
            // A surviving grandchild can hold the pipes open, so bound the wait.
            let _ = tokio::time::timeout(drain, async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;

            let event = match status {
                Ok(status) => ProcessEvent::Terminated(status.code()),
                Err(e) => ProcessEvent::Error(format!("Wait error: {}", e)),
            };
            let _ = tx.send(event).await;
        });

        log::debug!("Spawned `{}` as PID {} in {:?}", spec.command, pid, spec.cwd);

        Ok((rx, Box::new(ShellProcessHandle { pid, exited })))
    }
}
