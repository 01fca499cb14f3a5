//! Batch runner for the component renderer
//!
//! Jobs are loaded from collected components or generated results, split
//! into batches, and each batch is rendered by a separate worker process with
//! its own template copy (`<react_app_dir>/t-<batch>`) and port range.

pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod worker;

pub use dispatch::{BatchReport, Dispatcher};
pub use error::BatchError;
pub use jobs::{extract_component_code, load_collected, load_generated, partition};
pub use worker::{build_renderer, run_jobs, run_worker, template_dir, WorkerSummary};
