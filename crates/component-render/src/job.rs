//! Render jobs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::paths;

/// Source language of a component file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Js,
    #[default]
    Jsx,
    Ts,
    Tsx,
}

impl ComponentKind {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            ComponentKind::Js => "js",
            ComponentKind::Jsx => "jsx",
            ComponentKind::Ts => "ts",
            ComponentKind::Tsx => "tsx",
        }
    }

    /// Parse an extension or file type label, unknown labels fall back to JSX
    pub fn from_label(label: &str) -> Self {
        match label.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "js" => ComponentKind::Js,
            "ts" => ComponentKind::Ts,
            "tsx" => ComponentKind::Tsx,
            _ => ComponentKind::Jsx,
        }
    }

    /// Name of the component file inside the components directory
    pub fn file_name(&self) -> String {
        format!("{}.{}", paths::COMPONENT_STEM, self.extension())
    }
}

/// One component to render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJob {
    /// Identifier used in logs
    pub id: String,
    /// Component source text
    pub source: String,
    /// Component file type
    #[serde(default)]
    pub kind: ComponentKind,
    /// Stylesheet text in CSS, SCSS or LESS, possibly empty
    #[serde(default)]
    pub style: String,
    /// Where the screenshot is written
    pub screenshot_path: PathBuf,
    /// Total number of output copies, the first being `screenshot_path`
    #[serde(default)]
    pub repeat: Option<u32>,
    /// Image assets referenced by the component as `./imgs/...`
    #[serde(default)]
    pub asset_dir: Option<PathBuf>,
}

impl RenderJob {
    pub fn new(id: impl Into<String>, source: impl Into<String>, screenshot_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            kind: ComponentKind::default(),
            style: String::new(),
            screenshot_path,
            repeat: None,
            asset_dir: None,
        }
    }

    pub fn with_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn with_asset_dir(mut self, dir: PathBuf) -> Self {
        self.asset_dir = Some(dir);
        self
    }

    /// Sibling paths receiving copies of the screenshot
    ///
    /// A screenshot stem ending in `_0` is numbered in place (`x_0.png` gives
    /// `x_1.png`, `x_2.png`); any other stem gets a `_<n>` suffix.
    pub fn repeat_paths(&self) -> Vec<PathBuf> {
        let count = match self.repeat {
            Some(n) if n > 1 => n,
            _ => return Vec::new(),
        };

        let stem = self
            .screenshot_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = stem.strip_suffix("_0").unwrap_or(&stem).to_string();
        let ext = self
            .screenshot_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "png".to_string());
        let parent = self.screenshot_path.parent().unwrap_or(Path::new(""));

        (1..count)
            .map(|n| parent.join(format!("{}_{}.{}", base, n, ext)))
            .collect()
    }
}
