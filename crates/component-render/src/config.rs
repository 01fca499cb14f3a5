//! Configuration for the render worker
//!
//! `RenderConfig` is read from a JSON file; every field falls back to the
//! defaults in [`crate::constants`]. `LlmConfig` comes from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::{browser, llm, ports, retry, timeouts};
use crate::repair::FatalLlmPolicy;

/// Render worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Shell command that starts the template's dev server
    pub dev_server_command: String,
    /// Seconds the dev server gets to print its URL
    pub server_start_timeout_secs: u64,
    /// Seconds bounding a whole start attempt
    pub server_hard_ceiling_secs: u64,
    /// Milliseconds of output collected after a compile failure marker
    pub compile_error_drain_ms: u64,
    /// Milliseconds between server start and screenshot
    pub settle_delay_ms: u64,
    /// Milliseconds between a failed start and the repair request
    pub repair_delay_ms: u64,
    /// Milliseconds slept before each job of a batch
    pub job_pacing_ms: u64,
    /// Start attempts per job (the repair loop bound)
    pub max_start_attempts: u32,
    /// First port of worker 0's range
    pub base_port: u16,
    /// Distance between worker port seeds
    pub port_stride: u16,
    /// Ports the allocator never returns
    pub reserved_ports: Vec<u16>,
    /// Ports probed before the allocator gives up
    pub max_port_probes: u32,
    /// Screenshot browser settings
    pub browser: BrowserConfig,
    /// Which LLM error kinds abort the job instead of failing the repair
    pub fatal_llm_policy: FatalLlmPolicy,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dev_server_command: "npm run start".to_string(),
            server_start_timeout_secs: timeouts::SERVER_START_SECS,
            server_hard_ceiling_secs: timeouts::SERVER_HARD_CEILING_SECS,
            compile_error_drain_ms: timeouts::COMPILE_ERROR_DRAIN_MS,
            settle_delay_ms: timeouts::SETTLE_DELAY_MS,
            repair_delay_ms: timeouts::REPAIR_DELAY_MS,
            job_pacing_ms: timeouts::JOB_PACING_MS,
            max_start_attempts: retry::MAX_START_ATTEMPTS,
            base_port: ports::BASE,
            port_stride: ports::WORKER_STRIDE,
            reserved_ports: ports::RESERVED.to_vec(),
            max_port_probes: ports::MAX_PROBES,
            browser: BrowserConfig::default(),
            fatal_llm_policy: FatalLlmPolicy::default(),
        }
    }
}

impl RenderConfig {
    /// Load configuration from a JSON file, or defaults if it does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await.map_err(ConfigError::Io)?;
        let config: Self = serde_json::from_str(&contents).map_err(ConfigError::Parse)?;
        log::info!("Loaded render configuration from {:?}", path);
        Ok(config)
    }

    pub fn server_start_timeout(&self) -> Duration {
        Duration::from_secs(self.server_start_timeout_secs)
    }

    pub fn server_hard_ceiling(&self) -> Duration {
        Duration::from_secs(self.server_hard_ceiling_secs)
    }

    pub fn compile_error_drain(&self) -> Duration {
        Duration::from_millis(self.compile_error_drain_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn repair_delay(&self) -> Duration {
        Duration::from_millis(self.repair_delay_ms)
    }

    pub fn job_pacing(&self) -> Duration {
        Duration::from_millis(self.job_pacing_ms)
    }

    /// Port seed for the worker with the given batch index
    pub fn port_seed(&self, worker_index: u16) -> u16 {
        ports::seed_for_worker(self.base_port, self.port_stride, worker_index)
    }
}

/// Headless browser settings for the screenshot capturer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Browser executable; searched on `PATH` when unset
    pub executable: Option<PathBuf>,
    /// Navigation timeout in seconds
    pub navigation_timeout_secs: u64,
    /// Pixels per auto-scroll step
    pub scroll_step_px: u32,
    /// Milliseconds between auto-scroll steps
    pub scroll_interval_ms: u64,
    /// Initial window width and height
    pub window_size: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            navigation_timeout_secs: timeouts::NAVIGATION_SECS,
            scroll_step_px: browser::SCROLL_STEP_PX,
            scroll_interval_ms: browser::SCROLL_INTERVAL_MS,
            window_size: browser::WINDOW_SIZE,
        }
    }
}

impl BrowserConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    /// Configured executable, or the first known browser found on `PATH`
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.executable {
            return Some(path.clone());
        }
        browser::CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
    }
}

/// Connection settings for the OpenAI-compatible repair service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API base URL, e.g. `https://api.example.com/v1`
    pub base_url: String,
    /// Bearer token
    pub api_key: Option<String>,
    /// Model identifier sent with each request
    pub model: String,
    /// Attempts per chat request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds between attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Sampling temperature, provider default when unset
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Completion token cap, provider default when unset
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_max_attempts() -> u32 {
    llm::MAX_ATTEMPTS
}

fn default_retry_delay() -> u64 {
    llm::RETRY_DELAY_SECS
}

impl LlmConfig {
    pub const ENV_BASE_URL: &'static str = "LLM_BASE_URL";
    pub const ENV_KEY: &'static str = "LLM_KEY";
    pub const ENV_MODEL: &'static str = "MODEL_NAME";

    /// Read the connection settings from `LLM_BASE_URL`, `LLM_KEY` and `MODEL_NAME`
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var(Self::ENV_BASE_URL)
            .map_err(|_| ConfigError::MissingEnv(Self::ENV_BASE_URL))?;
        let model =
            std::env::var(Self::ENV_MODEL).map_err(|_| ConfigError::MissingEnv(Self::ENV_MODEL))?;
        let api_key = std::env::var(Self::ENV_KEY).ok().filter(|k| !k.is_empty());

        Ok(Self {
            base_url,
            api_key,
            model,
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            temperature: None,
            max_tokens: None,
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),
}
