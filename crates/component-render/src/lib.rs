//! Render-and-recover worker for React components
//!
//! This library takes a component of unknown quality, drops it into a
//! pre-scaffolded template project, and drives the project's dev server until
//! a screenshot of the rendered page can be taken:
//! - **Supervisor**: starts the dev server and classifies the attempt
//! - **Repair**: sends start failures to an LLM and applies the patched source
//! - **Capture**: screenshots the served page in a headless browser
//! - **Reaper**: force-frees the session's port between attempts and jobs
//!
//! # Example
//!
//! ```rust,ignore
//! use component_render::*;
//! use std::sync::Arc;
//!
//! let config = RenderConfig::default();
//! let reaper = Arc::new(SystemPortReaper::default());
//! let chat = Arc::new(OpenAiChatClient::new(LlmConfig::from_env()?));
//! let capturer = Arc::new(ChromeCapturer::new(config.browser.clone()));
//!
//! let session = RendererSession::init("/work/t-1".into(), config.port_seed(1), &config, &*reaper).await?;
//! let mut renderer = Renderer::new(
//!     session,
//!     config,
//!     Arc::new(ShellProcessSpawner::new()),
//!     reaper,
//!     chat,
//!     capturer,
//! );
//!
//! for job in jobs {
//!     let outcome = renderer.render_code(&job).await?;
//!     log::info!("{}: {:?}", job.id, outcome);
//! }
//! ```

pub mod capture;
pub mod config;
pub mod constants;
pub mod job;
pub mod llm;
pub mod port;
pub mod process;
pub mod reaper;
pub mod renderer;
pub mod repair;
pub mod style;
pub mod supervisor;

// Re-exports for convenience
pub use capture::{ChromeCapturer, ScreenshotCapturer};
pub use config::{BrowserConfig, ConfigError, LlmConfig, RenderConfig};
pub use job::{ComponentKind, RenderJob};
pub use llm::{ChatRequest, ChatResponse, ChatService, OpenAiChatClient, UsageSnapshot, UsageStats};
pub use port::{find_available_port, find_available_port_within, is_port_available, PortError};
pub use process::{ProcessEvent, ProcessHandle, ProcessSpawner, ShellProcessSpawner, SpawnSpec};
pub use reaper::{PortReaper, ReaperError, SystemPortReaper};
pub use renderer::{JobFailure, RenderError, RenderOutcome, Renderer, RendererSession};
pub use repair::{FatalLlmPolicy, RepairError, RepairResult, Repairer};
pub use style::StyleLanguage;
pub use supervisor::{
    DevServerSupervisor, RunningServer, StartOutcome, SupervisorConfig, SupervisorError,
};
