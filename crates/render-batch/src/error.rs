//! Batch runner errors

use component_render::{ConfigError, RenderError};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("IO error on {context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error("Invalid JSON in {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Fatal LLM error while rendering {job}")]
    FatalLlm { job: String },
    #[error("Batch {batch} failed: {message}")]
    Worker { batch: u16, message: String },
}

impl BatchError {
    pub(crate) fn io(context: impl std::fmt::Debug) -> impl FnOnce(std::io::Error) -> BatchError {
        let context = format!("{:?}", context);
        move |source| BatchError::Io { context, source }
    }

    pub(crate) fn json(
        context: impl std::fmt::Debug,
    ) -> impl FnOnce(serde_json::Error) -> BatchError {
        let context = format!("{:?}", context);
        move |source| BatchError::Json { context, source }
    }
}
