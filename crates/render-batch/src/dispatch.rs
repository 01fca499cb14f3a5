//! Worker process dispatch
//!
//! Every batch runs in its own OS process so a crashed dev server, a stuck
//! browser or a leaked port only takes down one batch. Jobs travel to the
//! worker as JSON on stdin; logs come back on the inherited stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use component_render::RenderJob;
use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::BatchError;

/// Result of one batch as seen by the dispatcher
#[derive(Debug)]
pub struct BatchReport {
    pub batch: u16,
    pub jobs: usize,
    pub result: Result<(), BatchError>,
}

/// Launches `program [prefix_args..] worker <batch> <react_app_dir> [config]`
/// once per batch
#[derive(Debug, Clone)]
pub struct Dispatcher {
    program: PathBuf,
    prefix_args: Vec<String>,
    react_app_dir: PathBuf,
    config_path: Option<PathBuf>,
}

impl Dispatcher {
    /// Dispatch to the running executable
    pub fn current_exe(
        react_app_dir: PathBuf,
        config_path: Option<PathBuf>,
    ) -> Result<Self, BatchError> {
        let program = std::env::current_exe().map_err(BatchError::io("current executable"))?;
        Ok(Self::new(program, react_app_dir, config_path))
    }

    pub fn new(program: PathBuf, react_app_dir: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            program,
            prefix_args: Vec::new(),
            react_app_dir,
            config_path,
        }
    }

    /// Arguments placed before `worker`, for wrapper programs
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn react_app_dir(&self) -> &Path {
        &self.react_app_dir
    }

    /// Run every batch concurrently and wait for all of them
    pub async fn run(&self, batches: Vec<(u16, Vec<RenderJob>)>) -> Vec<BatchReport> {
        log::info!("Processing {} batch(es)", batches.len());

        let runs = batches.into_iter().map(|(batch, jobs)| async move {
            let count = jobs.len();
            let result = self.run_batch(batch, &jobs).await;
            BatchReport {
                batch,
                jobs: count,
                result,
            }
        });
        let reports = join_all(runs).await;

        for report in &reports {
            match &report.result {
                Ok(()) => log::info!(
                    "Batch {} processed successfully ({} jobs)",
                    report.batch,
                    report.jobs
                ),
                Err(e) => log::error!("Batch {} failed: {}", report.batch, e),
            }
        }
        reports
    }

    async fn run_batch(&self, batch: u16, jobs: &[RenderJob]) -> Result<(), BatchError> {
        let payload = serde_json::to_vec(jobs).map_err(BatchError::json(batch))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg("worker")
            .arg(batch.to_string())
            .arg(&self.react_app_dir);
        if let Some(config) = &self.config_path {
            command.arg(config);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| BatchError::Worker {
            batch,
            message: format!("failed to spawn {:?}: {}", self.program, e),
        })?;
        log::debug!("Batch {} worker started (PID {:?})", batch, child.id());

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(BatchError::io(format!("batch {} stdin", batch)))?;
            // Closing stdin ends the worker's read
            drop(stdin);
        }

        let status = child
            .wait()
            .await
            .map_err(BatchError::io(format!("batch {} worker", batch)))?;

        if status.success() {
            Ok(())
        } else {
            Err(BatchError::Worker {
                batch,
                message: format!("worker stopped with {}", status),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash_worker(script: &str) -> Dispatcher {
        // `bash -c script bash worker <batch> <dir>`: $1 = worker, $2 = batch, $3 = dir
        Dispatcher::new(PathBuf::from("/bin/bash"), PathBuf::new(), None).with_prefix_args(vec![
            "-c".to_string(),
            script.to_string(),
            "bash".to_string(),
        ])
    }

    fn jobs(n: usize) -> Vec<RenderJob> {
        (0..n)
            .map(|i| {
                RenderJob::new(format!("job{}", i), "x", PathBuf::from(format!("/o/{}.png", i)))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_jobs_reach_worker_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = bash_worker("cat > \"$3/batch-$2.json\"");
        dispatcher.react_app_dir = dir.path().to_path_buf();

        let reports = dispatcher.run(vec![(1, jobs(2)), (2, jobs(1))]).await;

        assert!(reports.iter().all(|r| r.result.is_ok()));
        let payload = std::fs::read(dir.path().join("batch-1.json")).unwrap();
        let received: Vec<RenderJob> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(received, jobs(2));
        assert!(dir.path().join("batch-2.json").exists());
    }

    #[tokio::test]
    async fn test_failing_worker_does_not_stop_others() {
        let dispatcher = bash_worker("cat > /dev/null; [ \"$2\" = 2 ] && exit 3; exit 0");

        let reports = dispatcher
            .run(vec![(1, jobs(1)), (2, jobs(1)), (3, jobs(1))])
            .await;

        assert_eq!(reports.len(), 3);
        assert!(reports[0].result.is_ok());
        assert!(matches!(
            reports[1].result,
            Err(BatchError::Worker { batch: 2, .. })
        ));
        assert!(reports[2].result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let dispatcher =
            Dispatcher::new(PathBuf::from("/nonexistent/render-batch"), PathBuf::new(), None);
        let reports = dispatcher.run(vec![(1, jobs(1))]).await;
        assert!(matches!(reports[0].result, Err(BatchError::Worker { batch: 1, .. })));
    }
}
