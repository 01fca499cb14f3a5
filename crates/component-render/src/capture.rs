//! Headless browser screenshots
//!
//! Capture never fails towards the caller: errors are logged and the output
//! file is simply not written, which the renderer reports as a missing
//! screenshot.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::{CaptureScreenshotFormatOption, Viewport};
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};

use crate::config::BrowserConfig;

/// Takes a full-page screenshot of a URL
#[async_trait]
pub trait ScreenshotCapturer: Send + Sync {
    /// Write a PNG of `url` to `out_path`; failures only leave the file absent
    async fn capture(&self, url: &str, out_path: &Path);
}

#[derive(Debug, thiserror::Error)]
enum CaptureError {
    #[error("No Chrome or Chromium executable found")]
    NoBrowser,
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn browser_err(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Browser(e.to_string())
}

/// Scrolls to the bottom in fixed steps so lazily loaded content appears.
/// The step cap keeps endless pages from hanging the capture.
fn auto_scroll_script(step_px: u32, interval_ms: u64) -> String {
    format!(
        "new Promise((resolve) => {{
            let total = 0;
            let steps = 0;
            const timer = setInterval(() => {{
                window.scrollBy(0, {step_px});
                total += {step_px};
                steps += 1;
                if (total >= document.body.scrollHeight || steps >= 500) {{
                    clearInterval(timer);
                    resolve(true);
                }}
            }}, {interval_ms});
        }})"
    )
}

const FORCE_VISIBLE_OVERFLOW: &str = "document.body.style.overflow = 'visible';
document.documentElement.style.overflow = 'visible';
true";

const PAGE_SIZE: &str = "JSON.stringify([
    Math.max(document.documentElement.scrollWidth, document.body ? document.body.scrollWidth : 0),
    Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)
])";

// The blank tab is already `complete`, so it never counts as ready
const READY_STATE: &str = "location.href === 'about:blank' ? 'loading' : document.readyState";

const READY_POLL: Duration = Duration::from_millis(100);

/// `readyState` leaves `loading` when DOMContentLoaded fires
fn dom_content_loaded(ready_state: Option<&str>) -> bool {
    matches!(ready_state, Some("interactive" | "complete"))
}

/// Screenshot capturer driving Chrome through `headless_chrome`
pub struct ChromeCapturer {
    config: BrowserConfig,
}

impl ChromeCapturer {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn launch(config: &BrowserConfig) -> Result<Browser, CaptureError> {
        let executable = config.resolve_executable().ok_or(CaptureError::NoBrowser)?;
        let options = LaunchOptionsBuilder::default()
            .headless(true)
            .sandbox(false)
            .path(Some(executable))
            .window_size(Some(config.window_size))
            .idle_browser_timeout(config.navigation_timeout() * 2)
            .args(vec![
                OsStr::new("--disable-setuid-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--hide-scrollbars"),
            ])
            .build()
            .map_err(browser_err)?;
        Browser::new(options).map_err(browser_err)
    }

    fn page_size(tab: &Tab) -> Result<(f64, f64), CaptureError> {
        let value = tab
            .evaluate(PAGE_SIZE, false)
            .map_err(browser_err)?
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| browser_err("page size was not returned"))?;
        let [width, height]: [f64; 2] = serde_json::from_str(&value).map_err(browser_err)?;
        Ok((width.max(1.0), height.max(1.0)))
    }

    fn wait_for_dom_content(tab: &Tab, timeout: Duration) -> Result<(), CaptureError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = tab
                .evaluate(READY_STATE, false)
                .map_err(browser_err)?
                .value
                .and_then(|v| v.as_str().map(str::to_string));
            if dom_content_loaded(state.as_deref()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(browser_err(format!(
                    "DOMContentLoaded not reached within {:?}",
                    timeout
                )));
            }
            std::thread::sleep(READY_POLL);
        }
    }

    /// Blocking capture; the browser process is closed when `browser` drops
    fn capture_blocking(
        config: &BrowserConfig,
        url: &str,
        out_path: &Path,
    ) -> Result<(), CaptureError> {
        let browser = Self::launch(config)?;
        let tab = browser.new_tab().map_err(browser_err)?;
        tab.set_default_timeout(config.navigation_timeout());

        tab.navigate_to(url).map_err(browser_err)?;
        Self::wait_for_dom_content(&tab, config.navigation_timeout())?;

        let scroll = auto_scroll_script(config.scroll_step_px, config.scroll_interval_ms);
        tab.evaluate(&scroll, true).map_err(browser_err)?;
        tab.evaluate(FORCE_VISIBLE_OVERFLOW, false)
            .map_err(browser_err)?;

        let (width, height) = Self::page_size(&tab)?;
        let clip = Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            scale: 1.0,
        };
        let png = tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, Some(clip), true)
            .map_err(browser_err)?;

        std::fs::write(out_path, png)?;
        Ok(())
    }
}

#[async_trait]
impl ScreenshotCapturer for ChromeCapturer {
    async fn capture(&self, url: &str, out_path: &Path) {
        let config = self.config.clone();
        let url_owned = url.to_string();
        let path: PathBuf = out_path.to_path_buf();

        let result = tokio::task::spawn_blocking(move || {
            ChromeCapturer::capture_blocking(&config, &url_owned, &path)
        })
        .await;

        match result {
            Ok(Ok(())) => log::info!("Screenshot taken: {:?}", out_path),
            Ok(Err(e)) => log::error!("Error taking screenshot of {}: {}", url, e),
            Err(e) => log::error!("Screenshot task for {} failed: {}", url, e),
        }
    }
}

impl Default for ChromeCapturer {
    fn default() -> Self {
        Self::new(BrowserConfig::default())
    }
}
