//! LLM-assisted repair of components that fail to start
//!
//! The failure log and the current component source go to the chat service;
//! the code block in its answer replaces the component file.

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::llm;
use crate::llm::{ChatRequest, ChatService};

static BACKTICK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(.*?)\n(.*?)```").expect("valid fence pattern"));

static QUOTE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)'''(.*?)\n(.*?)'''").expect("valid fence pattern"));

const LANGUAGE_TAGS: &[&str] = &["javascript", "typescript", "css", "scss", "sass", "less", "bash"];

/// Decides which chat error kinds abort the whole job
///
/// A fatal failure stops the repair loop immediately; a non-fatal one only
/// means this repair produced no patch.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalLlmPolicy {
    /// No chat failure is fatal
    #[default]
    Never,
    /// Rejected requests (400, 401, 402, 422) are fatal
    ClientErrors,
    /// Everything except transient server errors (500, 504) is fatal
    AllButServerErrors,
    /// Caller-supplied classification
    #[serde(skip)]
    Custom(Arc<dyn Fn(u16) -> bool + Send + Sync>),
}

impl FatalLlmPolicy {
    pub fn is_fatal(&self, error_kind: u16) -> bool {
        match self {
            FatalLlmPolicy::Never => false,
            FatalLlmPolicy::ClientErrors => llm::NON_RETRYABLE.contains(&error_kind),
            FatalLlmPolicy::AllButServerErrors => {
                error_kind != llm::OK && !llm::SERVER_ERRORS.contains(&error_kind)
            }
            FatalLlmPolicy::Custom(classify) => classify(error_kind),
        }
    }
}

impl std::fmt::Debug for FatalLlmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalLlmPolicy::Never => write!(f, "Never"),
            FatalLlmPolicy::ClientErrors => write!(f, "ClientErrors"),
            FatalLlmPolicy::AllButServerErrors => write!(f, "AllButServerErrors"),
            FatalLlmPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Outcome of one repair request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairResult {
    /// Patched source, already written to the component file
    pub patched: Option<String>,
    /// The chat failure must end the job
    pub fatal: bool,
}

/// Repair errors
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prompt asking for a corrected component
pub fn build_repair_prompt(error_log: &str, code: &str) -> String {
    format!(
        "Task: Fix the React component below so that the development server starts without errors.

Error Message:
{error_log}

Component Code:
{code}

Instructions:
1. Read the error message produced while starting the development server.
2. Find the problems in the component code that cause it. The code may be JavaScript or TypeScript.
3. Fix syntax errors and typos.
4. Keep the component a valid React component.
5. Change only what is needed to resolve the reported errors, and do not add debugging statements.
6. Replace dependencies that fail to resolve with inline, self-contained code.

Expected Output:
Reply with the corrected component code only, inside one markdown code block tagged with its language:

```javascript
<UPDATED_COMPONENT_CODE>
```

or

```typescript
<UPDATED_COMPONENT_CODE>
```

Do not add comments, labels or explanations outside the code block.
"
    )
}

/// Extract the code from a chat answer
pub fn post_process_llm_result(content: &str) -> String {
    let content = content.strip_suffix("</s>").unwrap_or(content);

    for fence in [&*BACKTICK_BLOCK, &*QUOTE_BLOCK] {
        if let Some(code) = fence.captures(content).and_then(|caps| caps.get(2)) {
            return code.as_str().to_string();
        }
    }

    let mut code = content.trim();
    for marker in ["```", "'''"] {
        code = code.strip_prefix(marker).unwrap_or(code);
    }
    for marker in ["```", "'''"] {
        code = code.strip_suffix(marker).unwrap_or(code);
    }
    for tag in LANGUAGE_TAGS {
        if let Some(rest) = code.strip_prefix(tag).and_then(|r| r.strip_prefix('\n')) {
            code = rest;
            break;
        }
    }
    code.to_string()
}

/// Repairs a component file through a chat service
pub struct Repairer {
    chat: Arc<dyn ChatService>,
    policy: FatalLlmPolicy,
}

impl Repairer {
    pub fn new(chat: Arc<dyn ChatService>, policy: FatalLlmPolicy) -> Self {
        Self { chat, policy }
    }

    /// Ask for a patch of `source_path` given the start failure `error_log`
    ///
    /// On success the file is overwritten with the patched source.
    pub async fn repair(
        &self,
        error_log: &str,
        source_path: &Path,
    ) -> Result<RepairResult, RepairError> {
        let code = fs::read_to_string(source_path).await?;
        let prompt = build_repair_prompt(error_log, &code);

        log::info!("Requesting repair of {:?}", source_path);
        let response = self.chat.chat(ChatRequest::new(prompt)).await;

        let patched = response
            .content
            .as_deref()
            .map(post_process_llm_result)
            .filter(|code| !code.trim().is_empty());

        match patched {
            Some(code) => {
                fs::write(source_path, &code).await?;
                log::info!("Applied repaired source to {:?}", source_path);
                Ok(RepairResult {
                    patched: Some(code),
                    fatal: false,
                })
            }
            None => {
                let fatal = self.policy.is_fatal(response.error_kind);
                log::warn!(
                    "Repair returned no code (error kind {}, fatal: {})",
                    response.error_kind,
                    fatal
                );
                Ok(RepairResult {
                    patched: None,
                    fatal,
                })
            }
        }
    }
}
