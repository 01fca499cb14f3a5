//! One batch, rendered sequentially in its own process

use std::path::{Path, PathBuf};
use std::sync::Arc;

use component_render::{
    ChatService, ChromeCapturer, OpenAiChatClient, PortReaper, RenderConfig, RenderJob,
    RenderOutcome, Renderer, RendererSession, ScreenshotCapturer, ShellProcessSpawner,
    SystemPortReaper,
};

use crate::error::BatchError;

/// Per-worker job counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &RenderOutcome) {
        match outcome {
            RenderOutcome::Rendered { .. } => self.rendered += 1,
            RenderOutcome::Skipped => self.skipped += 1,
            RenderOutcome::Failed { .. } | RenderOutcome::FatalLlm => self.failed += 1,
        }
    }
}

/// Template copy used by batch `batch`
pub fn template_dir(react_app_dir: &Path, batch: u16) -> PathBuf {
    react_app_dir.join(format!("t-{}", batch))
}

/// Build the renderer for `batch` from the system collaborators
pub async fn build_renderer(
    batch: u16,
    react_app_dir: &Path,
    config: RenderConfig,
    chat: Arc<dyn ChatService>,
) -> Result<Renderer, BatchError> {
    let reaper: Arc<dyn PortReaper> = Arc::new(SystemPortReaper::new());
    let capturer: Arc<dyn ScreenshotCapturer> =
        Arc::new(ChromeCapturer::new(config.browser.clone()));

    let session = RendererSession::init(
        template_dir(react_app_dir, batch),
        config.port_seed(batch),
        &config,
        reaper.as_ref(),
    )
    .await?;
    log::info!("Running at port {}", session.port());

    Ok(Renderer::new(
        session,
        config,
        Arc::new(ShellProcessSpawner::new()),
        reaper,
        chat,
        capturer,
    ))
}

/// Render `jobs` one after another
///
/// A job failure only counts against the summary. A fatal LLM error or a
/// [`component_render::RenderError`] ends the batch.
pub async fn run_jobs(
    renderer: &mut Renderer,
    jobs: &[RenderJob],
) -> Result<WorkerSummary, BatchError> {
    let pacing = renderer.config().job_pacing();
    let mut summary = WorkerSummary::default();

    for (i, job) in jobs.iter().enumerate() {
        tokio::time::sleep(pacing).await;
        log::info!("Processing {}/{}: {}", i + 1, jobs.len(), job.id);

        let outcome = renderer.render_code(job).await?;
        summary.record(&outcome);
        if outcome == RenderOutcome::FatalLlm {
            return Err(BatchError::FatalLlm {
                job: job.id.clone(),
            });
        }
    }

    Ok(summary)
}

/// Worker process entry: render `jobs` as batch `batch`
pub async fn run_worker(
    batch: u16,
    react_app_dir: &Path,
    config: RenderConfig,
    jobs: Vec<RenderJob>,
) -> Result<WorkerSummary, BatchError> {
    let llm_config = component_render::LlmConfig::from_env()?;
    let chat = Arc::new(OpenAiChatClient::new(llm_config));

    let mut renderer = build_renderer(batch, react_app_dir, config, chat.clone()).await?;
    let summary = run_jobs(&mut renderer, &jobs).await?;

    let usage = chat.usage();
    log::info!(
        "Batch {} completed: {} rendered, {} skipped, {} failed ({} LLM requests, {} tokens)",
        batch,
        summary.rendered,
        summary.skipped,
        summary.failed,
        usage.requests,
        usage.total_tokens()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use component_render::{ChatRequest, ChatResponse, ReaperError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopReaper;

    #[async_trait]
    impl PortReaper for NoopReaper {
        async fn clear_port(&self, _port: u16) -> Result<(), ReaperError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingChat {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatService for CountingChat {
        async fn chat(&self, _request: ChatRequest) -> ChatResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ChatResponse::failed(403)
        }
    }

    #[test]
    fn test_template_dir_per_batch() {
        assert_eq!(template_dir(Path::new("/apps"), 3), PathBuf::from("/apps/t-3"));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = WorkerSummary::default();
        summary.record(&RenderOutcome::Skipped);
        summary.record(&RenderOutcome::Rendered {
            screenshots: vec![],
        });
        summary.record(&RenderOutcome::FatalLlm);
        assert_eq!(
            summary,
            WorkerSummary {
                rendered: 1,
                skipped: 1,
                failed: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_screenshots_are_paced_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = RenderConfig::default();
        let reaper = Arc::new(NoopReaper);
        let session = RendererSession::init(
            template_dir(dir.path(), 1),
            config.port_seed(1) + 40000,
            &config,
            reaper.as_ref(),
        )
        .await
        .unwrap();
        let chat = Arc::new(CountingChat::default());
        let mut renderer = Renderer::new(
            session,
            config,
            Arc::new(ShellProcessSpawner::new()),
            reaper,
            chat.clone(),
            Arc::new(ChromeCapturer::default()),
        );

        let jobs: Vec<RenderJob> = (0..3)
            .map(|i| {
                let shot = dir.path().join(format!("done_{}.png", i));
                std::fs::write(&shot, b"png").unwrap();
                RenderJob::new(format!("done_{}", i), "export default 1;", shot)
            })
            .collect();

        let started = tokio::time::Instant::now();
        let summary = run_jobs(&mut renderer, &jobs).await.unwrap();

        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.rendered + summary.failed, 0);
        assert!(started.elapsed() >= std::time::Duration::from_secs(3));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert!(dir.path().join("t-1/src/components").is_dir());
    }
}
