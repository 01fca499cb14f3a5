//! Dev-server start supervision
//!
//! One call to [`DevServerSupervisor::start_server`] is one start attempt:
//!
//! ```text
//! Idle -> Starting -> Listening      URL with a port printed
//!                  -> TimedOut       nothing decisive before the start timeout
//!                  -> PortConflict   "Something is already running on port"
//!                  -> Crashed        exit before listening, or "Failed to compile"
//! ```
//!
//! The attempt resolves exactly once, from whichever trigger fires first.
//! Failed attempts are terminated before returning. Successful ones hand the
//! process back as a [`RunningServer`], terminated when dropped or stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::RenderConfig;
use crate::constants::markers;
use crate::process::{ProcessEvent, ProcessHandle, ProcessSpawner, SpawnSpec};

static LOCAL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"http://(?:localhost|127\.0\.0\.1):(\d+)").expect("valid URL pattern")
});

/// Extract the port of a loopback URL printed by the dev server
pub fn parse_listening_port(line: &str) -> Option<u16> {
    LOCAL_URL
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Supervisor timing and command
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shell command starting the dev server
    pub command: String,
    /// Time allowed for the URL to appear
    pub start_timeout: Duration,
    /// Bound on the whole attempt, spawn included
    pub hard_ceiling: Duration,
    /// Output still collected after a compile failure marker
    pub compile_error_drain: Duration,
}

impl From<&RenderConfig> for SupervisorConfig {
    fn from(config: &RenderConfig) -> Self {
        Self {
            command: config.dev_server_command.clone(),
            start_timeout: config.server_start_timeout(),
            hard_ceiling: config.server_hard_ceiling(),
            compile_error_drain: config.compile_error_drain(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

/// Failed start attempts
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Something is already running on port {port}")]
    PortConflict { port: u16, log: String },
    #[error("Dev server failed to start (exit code {exit_code:?})")]
    Crashed { exit_code: Option<i32>, log: String },
    #[error("Failed to spawn dev server: {0}")]
    Spawn(String),
}

impl SupervisorError {
    /// Combined output collected during the attempt
    pub fn log(&self) -> &str {
        match self {
            SupervisorError::PortConflict { log, .. } | SupervisorError::Crashed { log, .. } => log,
            SupervisorError::Spawn(msg) => msg,
        }
    }
}

/// A dev server left running after a successful start
///
/// The process receives SIGTERM on [`RunningServer::stop`] or when dropped.
pub struct RunningServer {
    handle: Option<Box<dyn ProcessHandle>>,
}

impl RunningServer {
    fn new(handle: Option<Box<dyn ProcessHandle>>) -> Self {
        Self { handle }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid())
    }

    pub fn stop(mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        if let Some(handle) = self.handle.take() {
            terminate_quietly(handle.as_ref());
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("pid", &self.pid())
            .finish()
    }
}

/// Successful start attempts
#[derive(Debug)]
pub enum StartOutcome {
    /// The server printed its URL
    Listening { port: u16, server: RunningServer },
    /// No decisive output before the start timeout; the page may still be served
    TimedOut { server: RunningServer },
}

impl StartOutcome {
    /// Port reported by the server, if it printed one
    pub fn port(&self) -> Option<u16> {
        match self {
            StartOutcome::Listening { port, .. } => Some(*port),
            StartOutcome::TimedOut { .. } => None,
        }
    }

    pub fn into_server(self) -> RunningServer {
        match self {
            StartOutcome::Listening { server, .. } | StartOutcome::TimedOut { server } => server,
        }
    }
}

/// What one start attempt observed
#[derive(Debug, Default, Clone)]
pub struct ServerAttempt {
    /// Combined stdout and stderr
    pub log: String,
    /// Port parsed from the server's URL line
    pub listening_port: Option<u16>,
    /// Exit code if the process ended
    pub exit_code: Option<i32>,
}

impl ServerAttempt {
    fn record(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }

    fn crashed(&mut self) -> SupervisorError {
        SupervisorError::Crashed {
            exit_code: self.exit_code,
            log: std::mem::take(&mut self.log),
        }
    }
}

enum AttemptEnd {
    Listening(u16),
    TimedOut,
}

fn terminate_quietly(handle: &dyn ProcessHandle) {
    if let Err(e) = handle.terminate() {
        log::debug!("Failed to terminate PID {}: {}", handle.pid(), e);
    }
}

/// Starts the template's dev server and classifies the attempt
pub struct DevServerSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    config: SupervisorConfig,
}

impl DevServerSupervisor {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: SupervisorConfig) -> Self {
        Self { spawner, config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one start attempt in `project_dir` with `PORT=port`
    pub async fn start_server(
        &self,
        project_dir: &Path,
        port: u16,
    ) -> Result<StartOutcome, SupervisorError> {
        log::info!("Starting dev server on port {} in {:?}", port, project_dir);
        let spec = SpawnSpec::new(self.config.command.clone(), project_dir)
            .env("PORT", port.to_string());

        let mut handle: Option<Box<dyn ProcessHandle>> = None;
        let end = match tokio::time::timeout(
            self.config.hard_ceiling,
            self.run_attempt(&spec, port, &mut handle),
        )
        .await
        {
            Ok(end) => end,
            Err(_) => {
                log::warn!(
                    "Start attempt exceeded {:?}, continuing as timed out",
                    self.config.hard_ceiling
                );
                Ok(AttemptEnd::TimedOut)
            }
        };

        match end {
            Ok(AttemptEnd::Listening(port)) => {
                log::info!("Dev server listening on port {}", port);
                Ok(StartOutcome::Listening {
                    port,
                    server: RunningServer::new(handle),
                })
            }
            Ok(AttemptEnd::TimedOut) => {
                // Left running through capture; the renderer stops it afterwards
                log::warn!("Dev server start timed out, proceeding to capture anyway");
                Ok(StartOutcome::TimedOut {
                    server: RunningServer::new(handle),
                })
            }
            Err(e) => {
                if let Some(handle) = handle {
                    terminate_quietly(handle.as_ref());
                }
                Err(e)
            }
        }
    }

    async fn run_attempt(
        &self,
        spec: &SpawnSpec,
        port: u16,
        slot: &mut Option<Box<dyn ProcessHandle>>,
    ) -> Result<AttemptEnd, SupervisorError> {
        let (rx, handle) = self
            .spawner
            .spawn(spec)
            .await
            .map_err(SupervisorError::Spawn)?;
        *slot = Some(handle);
        self.watch(rx, port).await
    }

    async fn watch(
        &self,
        mut rx: mpsc::Receiver<ProcessEvent>,
        port: u16,
    ) -> Result<AttemptEnd, SupervisorError> {
        let soft_deadline = Instant::now() + self.config.start_timeout;
        let mut drain_deadline: Option<Instant> = None;
        let mut attempt = ServerAttempt::default();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ProcessEvent::Stdout(bytes)) | Some(ProcessEvent::Stderr(bytes)) => {
                        let line = String::from_utf8_lossy(&bytes);
                        log::debug!("[dev-server] {}", line);
                        attempt.record(&line);

                        if line.contains(markers::PORT_IN_USE) {
                            log::warn!("Port {} is already in use", port);
                            return Err(SupervisorError::PortConflict {
                                port,
                                log: std::mem::take(&mut attempt.log),
                            });
                        }

                        if line.contains(markers::FAILED_TO_COMPILE) && drain_deadline.is_none() {
                            log::warn!("Dev server reported a compile failure");
                            drain_deadline = Some(Instant::now() + self.config.compile_error_drain);
                        }

                        if drain_deadline.is_none() {
                            if let Some(found) = parse_listening_port(&line) {
                                attempt.listening_port = Some(found);
                                return Ok(AttemptEnd::Listening(found));
                            }
                        }
                    }
                    Some(ProcessEvent::Error(e)) => {
                        log::warn!("Dev server process error: {}", e);
                        attempt.record(&e);
                        return Err(attempt.crashed());
                    }
                    Some(ProcessEvent::Terminated(code)) => {
                        log::warn!("Dev server exited with code {:?} before listening", code);
                        attempt.exit_code = code;
                        return Err(attempt.crashed());
                    }
                    None => return Err(attempt.crashed()),
                },
                _ = sleep_until(drain_deadline.unwrap_or(soft_deadline)), if drain_deadline.is_some() => {
                    return Err(attempt.crashed());
                }
                _ = sleep_until(soft_deadline) => {
                    if drain_deadline.is_some() {
                        return Err(attempt.crashed());
                    }
                    return Ok(AttemptEnd::TimedOut);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays `(delay, event)` pairs; the channel stays open afterwards
    struct ScriptedSpawner {
        script: Vec<(Duration, ProcessEvent)>,
        terminations: Arc<AtomicUsize>,
    }

    struct CountingHandle(Arc<AtomicUsize>);

    impl ProcessHandle for CountingHandle {
        fn pid(&self) -> u32 {
            4242
        }

        fn terminate(&self) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessSpawner for ScriptedSpawner {
        async fn spawn(
            &self,
            spec: &SpawnSpec,
        ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String> {
            assert!(spec.env_value("PORT").is_some());
            let (tx, rx) = mpsc::channel(64);
            let script = self.script.clone();
            tokio::spawn(async move {
                for (delay, event) in script {
                    tokio::time::sleep(delay).await;
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                // Hold the channel open like a server that keeps running
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
            Ok((rx, Box::new(CountingHandle(self.terminations.clone()))))
        }
    }

    fn out(line: &str) -> ProcessEvent {
        ProcessEvent::Stdout(line.as_bytes().to_vec())
    }

    fn supervisor(script: Vec<(Duration, ProcessEvent)>) -> (DevServerSupervisor, Arc<AtomicUsize>) {
        let terminations = Arc::new(AtomicUsize::new(0));
        let spawner = ScriptedSpawner {
            script,
            terminations: terminations.clone(),
        };
        (
            DevServerSupervisor::new(Arc::new(spawner), SupervisorConfig::default()),
            terminations,
        )
    }

    #[test]
    fn test_parse_listening_port() {
        assert_eq!(parse_listening_port("  Local:   http://localhost:3007"), Some(3007));
        assert_eq!(
            parse_listening_port("Project is running at http://127.0.0.1:8080/"),
            Some(8080)
        );
        assert_eq!(parse_listening_port("On Your Network: http://192.168.1.2:3000"), None);
        assert_eq!(parse_listening_port("Compiling..."), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_line_means_listening() {
        let (sup, terminations) = supervisor(vec![
            (Duration::from_secs(1), out("Starting the development server...")),
            (Duration::from_secs(4), out("  Local:            http://localhost:3007")),
        ]);

        let outcome = sup.start_server(Path::new("/tmp"), 3000).await.unwrap();
        assert_eq!(outcome.port(), Some(3007));
        assert_eq!(terminations.load(Ordering::SeqCst), 0);

        outcome.into_server().stop();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_conflict_terminates_attempt() {
        let (sup, terminations) = supervisor(vec![(
            Duration::from_millis(200),
            out("Something is already running on port 3000."),
        )]);

        let err = sup.start_server(Path::new("/tmp"), 3000).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortConflict { port: 3000, .. }));
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_before_listening_is_crash() {
        let (sup, _) = supervisor(vec![
            (
                Duration::from_millis(100),
                ProcessEvent::Stderr(b"SyntaxError: Unexpected token (3:4)".to_vec()),
            ),
            (Duration::from_millis(100), ProcessEvent::Terminated(Some(1))),
        ]);

        match sup.start_server(Path::new("/tmp"), 3000).await.unwrap_err() {
            SupervisorError::Crashed { exit_code, log } => {
                assert_eq!(exit_code, Some(1));
                assert!(log.contains("SyntaxError"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_without_url_is_crash() {
        let (sup, _) = supervisor(vec![(Duration::from_millis(100), ProcessEvent::Terminated(Some(0)))]);
        let err = sup.start_server(Path::new("/tmp"), 3000).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Crashed { exit_code: Some(0), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_failure_drains_then_crashes() {
        let (sup, terminations) = supervisor(vec![
            (Duration::from_secs(2), out("Failed to compile.")),
            (Duration::from_millis(500), out("./src/components/component.jsx")),
            (Duration::from_millis(500), out("  Local: http://localhost:3000")),
        ]);

        match sup.start_server(Path::new("/tmp"), 3000).await.unwrap_err() {
            SupervisorError::Crashed { log, .. } => {
                assert!(log.contains("Failed to compile"));
                assert!(log.contains("component.jsx"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_optimistic_timeout() {
        let (sup, terminations) = supervisor(vec![(Duration::from_secs(1), out("Starting..."))]);

        let started = Instant::now();
        let outcome = sup.start_server(Path::new("/tmp"), 3000).await.unwrap();
        assert!(matches!(outcome, StartOutcome::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(started.elapsed() < Duration::from_secs(91));

        drop(outcome);
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_ceiling_bounds_slow_spawn() {
        struct HangingSpawner;

        #[async_trait]
        impl ProcessSpawner for HangingSpawner {
            async fn spawn(
                &self,
                _spec: &SpawnSpec,
            ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Err("never".to_string())
            }
        }

        let sup = DevServerSupervisor::new(Arc::new(HangingSpawner), SupervisorConfig::default());
        let started = Instant::now();
        let outcome = sup.start_server(Path::new("/tmp"), 3000).await.unwrap();
        assert!(matches!(outcome, StartOutcome::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(121));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        struct FailingSpawner;

        #[async_trait]
        impl ProcessSpawner for FailingSpawner {
            async fn spawn(
                &self,
                _spec: &SpawnSpec,
            ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String> {
                Err("no shell".to_string())
            }
        }

        let sup = DevServerSupervisor::new(Arc::new(FailingSpawner), SupervisorConfig::default());
        let err = sup.start_server(Path::new("/tmp"), 3000).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert_eq!(err.log(), "no shell");
    }
}
