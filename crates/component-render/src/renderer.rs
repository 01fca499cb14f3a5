//! Per-job render orchestration
//!
//! A worker owns one [`RendererSession`]: a template project and a port,
//! reused for every job. [`Renderer::render_code`] runs one job through
//!
//! ```text
//! write files -> start server -(crash)-> repair -> start server ... -> settle -> capture
//!                                 \-> cleanup: stop server, reap port, reset components dir
//! ```
//!
//! Cleanup runs on every path. Job-level failures, including I/O on the job's
//! own assets and screenshots, are returned as a [`RenderOutcome`]; only
//! problems that would poison the next job (a port that cannot be freed, I/O
//! on the shared template) escape as [`RenderError`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::capture::ScreenshotCapturer;
use crate::config::RenderConfig;
use crate::constants::paths;
use crate::job::RenderJob;
use crate::llm::ChatService;
use crate::port::{find_available_port_within, PortError};
use crate::process::ProcessSpawner;
use crate::reaper::{PortReaper, ReaperError};
use crate::repair::{RepairError, Repairer};
use crate::style;
use crate::supervisor::{DevServerSupervisor, RunningServer, SupervisorConfig, SupervisorError};

/// Why a job produced no screenshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailure {
    /// The port stayed taken for every start attempt
    PortConflict,
    /// The server kept failing to start until attempts ran out
    StartCrash,
    /// The repair service returned no patch
    RepairUnavailable,
    /// The capturer wrote no file
    ScreenshotMissing,
    /// The job's own files (assets, screenshot directory, repeat copies)
    /// could not be read or written
    Output,
}

/// Result of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The screenshot already existed; nothing was done
    Skipped,
    /// Screenshot and its repeat copies written
    Rendered { screenshots: Vec<PathBuf> },
    /// The job failed; the batch goes on
    Failed { reason: JobFailure },
    /// The repair service failed in a way the policy treats as fatal
    FatalLlm,
}

impl RenderOutcome {
    pub fn is_rendered(&self) -> bool {
        matches!(self, RenderOutcome::Rendered { .. })
    }
}

/// Errors that end the worker, not just the job
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Port reaper failed: {0}")]
    Reaper(#[from] ReaperError),
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Port allocation failed: {0}")]
    Port(#[from] PortError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RenderError + '_ {
    move |source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// I/O failure confined to one job
fn output_failed(path: &Path, e: std::io::Error) -> RenderOutcome {
    log::error!("Failed to handle job file {:?}: {}", path, e);
    RenderOutcome::Failed {
        reason: JobFailure::Output,
    }
}

/// A worker's template project, port and repair counter
#[derive(Debug)]
pub struct RendererSession {
    template_dir: PathBuf,
    port: u16,
    retry_count: u32,
}

impl RendererSession {
    /// Claim a free port at or above `port_seed`, make sure nothing holds it,
    /// and make sure the template's components directory exists
    pub async fn init(
        template_dir: PathBuf,
        port_seed: u16,
        config: &RenderConfig,
        reaper: &dyn PortReaper,
    ) -> Result<Self, RenderError> {
        let port =
            find_available_port_within(port_seed, &config.reserved_ports, config.max_port_probes)?;
        reaper.clear_port(port).await?;

        let session = Self {
            template_dir,
            port,
            retry_count: 0,
        };
        let components = session.components_dir();
        fs::create_dir_all(&components)
            .await
            .map_err(io_err(&components))?;

        log::info!(
            "Session ready: template {:?}, port {}",
            session.template_dir,
            session.port
        );
        Ok(session)
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Supervisor invocations made for the current job
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn components_dir(&self) -> PathBuf {
        self.template_dir.join(paths::COMPONENTS_DIR)
    }
}

/// Delete and recreate a directory
async fn reset_dir(path: &Path) -> Result<(), RenderError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(path)(e)),
    }
    fs::create_dir_all(path).await.map_err(io_err(path))
}

/// The components directory, held by one job at a time
///
/// Release resets it to empty. If the job is dropped before release, the
/// reset happens synchronously in `Drop`.
struct ComponentsDir {
    path: PathBuf,
    released: bool,
}

impl ComponentsDir {
    async fn acquire(path: PathBuf) -> Result<Self, RenderError> {
        fs::create_dir_all(&path).await.map_err(io_err(&path))?;
        Ok(Self {
            path,
            released: false,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn release(mut self) -> Result<(), RenderError> {
        self.released = true;
        log::debug!("Clearing {:?}", self.path);
        reset_dir(&self.path).await
    }
}

impl Drop for ComponentsDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let _ = std::fs::remove_dir_all(&self.path);
        if let Err(e) = std::fs::create_dir_all(&self.path) {
            log::error!("Failed to recreate {:?}: {}", self.path, e);
        }
    }
}

/// Drives jobs through start, repair, capture and cleanup
pub struct Renderer {
    session: RendererSession,
    config: RenderConfig,
    supervisor: DevServerSupervisor,
    reaper: Arc<dyn PortReaper>,
    repairer: Repairer,
    capturer: Arc<dyn ScreenshotCapturer>,
}

impl Renderer {
    pub fn new(
        session: RendererSession,
        config: RenderConfig,
        spawner: Arc<dyn ProcessSpawner>,
        reaper: Arc<dyn PortReaper>,
        chat: Arc<dyn ChatService>,
        capturer: Arc<dyn ScreenshotCapturer>,
    ) -> Self {
        let supervisor = DevServerSupervisor::new(spawner, SupervisorConfig::from(&config));
        let repairer = Repairer::new(chat, config.fatal_llm_policy.clone());
        Self {
            session,
            config,
            supervisor,
            reaper,
            repairer,
            capturer,
        }
    }

    pub fn session(&self) -> &RendererSession {
        &self.session
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Render one job
    pub async fn render_code(&mut self, job: &RenderJob) -> Result<RenderOutcome, RenderError> {
        if fs::try_exists(&job.screenshot_path).await.unwrap_or(false) {
            log::info!("Screenshot already exists: {:?}", job.screenshot_path);
            return Ok(RenderOutcome::Skipped);
        }

        log::info!("Rendering {} on port {}", job.id, self.session.port);
        self.session.retry_count = 0;
        let components = ComponentsDir::acquire(self.session.components_dir()).await?;

        let result = match self.write_component(job, components.path()).await {
            Ok(Ok(source_path)) => self.render_written(job, &source_path).await,
            Ok(Err(outcome)) => Ok(outcome),
            Err(e) => Err(e),
        };

        // Cleanup, whatever happened above
        log::info!("Clearing port {}", self.session.port);
        let reaped = self.reaper.clear_port(self.session.port).await;
        if let Err(e) = &reaped {
            log::error!("Error cleaning up port {}: {}", self.session.port, e);
        }
        let released = components.release().await;

        let outcome = result?;
        reaped?;
        released?;

        match &outcome {
            RenderOutcome::Rendered { screenshots } => {
                log::info!("Rendered {} ({} screenshot(s))", job.id, screenshots.len())
            }
            RenderOutcome::Failed { reason } => log::error!("Failed to render {}: {:?}", job.id, reason),
            RenderOutcome::FatalLlm => log::error!("Fatal LLM error while rendering {}", job.id),
            RenderOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    /// Write the stylesheet, component and assets; returns the component path
    async fn write_component(
        &self,
        job: &RenderJob,
        dir: &Path,
    ) -> Result<Result<PathBuf, RenderOutcome>, RenderError> {
        let source_path = dir.join(job.kind.file_name());

        match style::normalize(&job.style).await {
            Some(css) => {
                let style_path = dir.join(paths::STYLE_FILE);
                fs::write(&style_path, css).await.map_err(io_err(&style_path))?;
                let source = format!("import './{}';\n{}", paths::STYLE_FILE, job.source);
                fs::write(&source_path, source)
                    .await
                    .map_err(io_err(&source_path))?;
            }
            None => {
                fs::write(&source_path, &job.source)
                    .await
                    .map_err(io_err(&source_path))?;
            }
        }

        if let Err(outcome) = self.stage_assets(job).await? {
            return Ok(Err(outcome));
        }
        Ok(Ok(source_path))
    }

    /// Copy the job's images where `./imgs/...` references resolve
    ///
    /// The target directories belong to the template; a bad source file or
    /// copy only fails the job.
    async fn stage_assets(
        &self,
        job: &RenderJob,
    ) -> Result<Result<(), RenderOutcome>, RenderError> {
        let mut targets = Vec::with_capacity(paths::ASSET_TARGETS.len());
        for target in paths::ASSET_TARGETS {
            let dir = self.session.template_dir.join(target);
            fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
            targets.push(dir);
        }

        let Some(asset_dir) = &job.asset_dir else {
            return Ok(Ok(()));
        };
        let mut entries = match fs::read_dir(asset_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ok(())),
            Err(e) => return Ok(Err(output_failed(asset_dir, e))),
        };

        let mut copied = 0usize;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Ok(Err(output_failed(asset_dir, e))),
            };
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            for target in &targets {
                let dest = target.join(entry.file_name());
                if let Err(e) = fs::copy(entry.path(), &dest).await {
                    return Ok(Err(output_failed(&dest, e)));
                }
            }
            copied += 1;
        }

        log::debug!("Staged {} asset(s) from {:?}", copied, asset_dir);
        Ok(Ok(()))
    }

    async fn render_written(
        &mut self,
        job: &RenderJob,
        source_path: &Path,
    ) -> Result<RenderOutcome, RenderError> {
        let server = match self.start_with_repair(source_path).await? {
            Ok(server) => server,
            Err(outcome) => return Ok(outcome),
        };

        tokio::time::sleep(self.config.settle_delay()).await;

        if let Some(parent) = job.screenshot_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                server.stop();
                return Ok(output_failed(parent, e));
            }
        }

        let url = format!("http://localhost:{}", self.session.port);
        self.capturer.capture(&url, &job.screenshot_path).await;
        server.stop();

        if !fs::try_exists(&job.screenshot_path).await.unwrap_or(false) {
            return Ok(RenderOutcome::Failed {
                reason: JobFailure::ScreenshotMissing,
            });
        }

        let mut screenshots = vec![job.screenshot_path.clone()];
        for copy in job.repeat_paths() {
            if let Err(e) = fs::copy(&job.screenshot_path, &copy).await {
                return Ok(output_failed(&copy, e));
            }
            screenshots.push(copy);
        }
        Ok(RenderOutcome::Rendered { screenshots })
    }

    /// Start attempts alternating with repairs, bounded by `max_start_attempts`
    ///
    /// The inner `Err` is a finished job outcome, the outer one a worker error.
    async fn start_with_repair(
        &mut self,
        source_path: &Path,
    ) -> Result<Result<RunningServer, RenderOutcome>, RenderError> {
        let max_attempts = self.config.max_start_attempts.max(1);

        loop {
            self.session.retry_count += 1;
            log::info!(
                "Server start round {}/{} on port {}",
                self.session.retry_count,
                max_attempts,
                self.session.port
            );

            let failure = match self
                .supervisor
                .start_server(&self.session.template_dir, self.session.port)
                .await
            {
                Ok(outcome) => {
                    if let Some(port) = outcome.port() {
                        self.session.port = port;
                    }
                    return Ok(Ok(outcome.into_server()));
                }
                Err(e) => e,
            };

            log::warn!("Failed to start server: {}", failure);
            self.reaper.clear_port(self.session.port).await?;
            let attempts_left = self.session.retry_count < max_attempts;

            if let SupervisorError::PortConflict { .. } = failure {
                if attempts_left {
                    continue;
                }
                return Ok(Err(RenderOutcome::Failed {
                    reason: JobFailure::PortConflict,
                }));
            }

            tokio::time::sleep(self.config.repair_delay()).await;
            log::debug!("Start log:\n{}", failure.log());

            if !attempts_left {
                return Ok(Err(RenderOutcome::Failed {
                    reason: JobFailure::StartCrash,
                }));
            }

            let repair = self
                .repairer
                .repair(failure.log(), source_path)
                .await
                .map_err(|RepairError::Io(source)| RenderError::Io {
                    path: source_path.to_path_buf(),
                    source,
                })?;

            if repair.fatal {
                return Ok(Err(RenderOutcome::FatalLlm));
            }
            if repair.patched.is_none() {
                return Ok(Err(RenderOutcome::Failed {
                    reason: JobFailure::RepairUnavailable,
                }));
            }
        }
    }
}
