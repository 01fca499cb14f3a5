//! Render-wide constants
//!
//! Single source of truth for the timings, ports and output markers the
//! render worker depends on. Configurable values use these as defaults.

/// Port allocation
pub mod ports {
    /// First port a worker probes when no seed is configured
    pub const BASE: u16 = 3000;
    /// Distance between the port seeds of consecutive workers
    pub const WORKER_STRIDE: u16 = 100;
    /// Ports never handed out, even when free
    pub const RESERVED: &[u16] = &[6000];
    /// Maximum number of consecutive ports probed before giving up
    pub const MAX_PROBES: u32 = 1000;

    /// Port seed for a worker, `BASE + index * stride`
    pub fn seed_for_worker(base: u16, stride: u16, index: u16) -> u16 {
        base.saturating_add(index.saturating_mul(stride))
    }
}

/// Timeout configuration
pub mod timeouts {
    /// Time the dev server gets to print its URL before we assume it is up
    pub const SERVER_START_SECS: u64 = 90;
    /// Ceiling on a whole start attempt, including spawn
    pub const SERVER_HARD_CEILING_SECS: u64 = 120;
    /// Output still collected after a compile failure marker, so the log
    /// handed to the repair step contains the actual error lines
    pub const COMPILE_ERROR_DRAIN_MS: u64 = 2000;
    /// Pause between a successful start and the screenshot
    pub const SETTLE_DELAY_MS: u64 = 2000;
    /// Pause between a failed start and the repair request
    pub const REPAIR_DELAY_MS: u64 = 2000;
    /// Pause before each job of a batch
    pub const JOB_PACING_MS: u64 = 1000;
    /// Page navigation timeout for the screenshot browser
    pub const NAVIGATION_SECS: u64 = 60;
    /// Bound on `lsof` / `kill` invocations made by the port reaper
    pub const REAPER_COMMAND_SECS: u64 = 5;
    /// Time output readers get to drain after the child exits
    pub const OUTPUT_DRAIN_MS: u64 = 500;
}

/// Repair loop bounds
pub mod retry {
    /// Maximum dev-server start attempts per job
    pub const MAX_START_ATTEMPTS: u32 = 2;
}

/// Markers emitted by the dev server
pub mod markers {
    /// Printed when `PORT` is already bound by another process
    pub const PORT_IN_USE: &str = "Something is already running on port";
    /// Printed by the bundler when the component does not build
    pub const FAILED_TO_COMPILE: &str = "Failed to compile";
}

/// Template project layout
pub mod paths {
    /// Directory (relative to the template root) that receives the component
    pub const COMPONENTS_DIR: &str = "src/components";
    /// Stylesheet written next to the component
    pub const STYLE_FILE: &str = "style.css";
    /// Base name of the component file, extension follows the job
    pub const COMPONENT_STEM: &str = "component";
    /// Asset directory name inside scraped repositories and the template
    pub const ASSETS_DIR: &str = "imgs";
    /// Template directories that receive a copy of the job's assets
    pub const ASSET_TARGETS: &[&str] = &["public/imgs", "build/imgs", "src/components/imgs"];
    /// Directories extending `PATH` for the spawned dev server
    pub const EXTRA_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";
}

/// Screenshot browser defaults
pub mod browser {
    /// Candidate executables searched on `PATH`
    pub const CANDIDATES: &[&str] = &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ];
    /// Pixels scrolled per step while triggering lazy content
    pub const SCROLL_STEP_PX: u32 = 100;
    /// Delay between scroll steps
    pub const SCROLL_INTERVAL_MS: u64 = 100;
    /// Initial window size
    pub const WINDOW_SIZE: (u32, u32) = (1280, 800);
}

/// LLM chat service defaults
pub mod llm {
    /// Attempts made by the chat client before giving up
    pub const MAX_ATTEMPTS: u32 = 10;
    /// Fixed delay between attempts
    pub const RETRY_DELAY_SECS: u64 = 20;
    /// Error kind reported on success
    pub const OK: u16 = 200;
    /// Error kind reported when every attempt failed
    pub const EXHAUSTED: u16 = 403;
    /// Error kind reported when the request body could not be sent
    pub const BAD_REQUEST: u16 = 400;
    /// Status codes that end the attempt loop immediately
    pub const NON_RETRYABLE: &[u16] = &[400, 401, 402, 422];
    /// Status codes considered transient server-side failures
    pub const SERVER_ERRORS: &[u16] = &[500, 504];
    /// Completion length at which output is counted as truncated
    pub const OUTPUT_TOKEN_LIMIT: u64 = 4095;
}
