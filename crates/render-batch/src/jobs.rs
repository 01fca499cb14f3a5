//! Job sources and batch partitioning
//!
//! Two sources produce [`RenderJob`]s:
//! - collected components, one JSON file per component under
//!   `<code_dir>/<repo>/<component>.json`
//! - generated results, a single JSON array whose `output` strings hold a
//!   stylesheet and a component separated by marker comments

use std::path::{Path, PathBuf};

use component_render::constants::paths;
use component_render::{ComponentKind, RenderJob};
use serde::Deserialize;
use tokio::fs;

use crate::error::BatchError;

/// Separates repository and component name in collected screenshot names
const NAME_SEPARATOR: &str = "-_-_-";

const CSS_MARKER: &str = "// CSS";

/// Marker comments announcing the component part of a generated output
const KIND_MARKERS: &[(&str, ComponentKind)] = &[
    ("// JavaScript (JS)", ComponentKind::Js),
    ("// TypeScript (TS)", ComponentKind::Ts),
    ("// JavaScript XML (JSX)", ComponentKind::Jsx),
    ("// TypeScript XML (TSX)", ComponentKind::Tsx),
];

/// A collected component file
#[derive(Debug, Default, Deserialize)]
struct CollectedComponent {
    filtered_css: Option<String>,
    raw_css: Option<String>,
    file_type: Option<String>,
    code_with_ori_img: Option<String>,
    debug_component: Option<String>,
    raw_component: Option<String>,
}

fn first_non_empty<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .find(|s| !s.is_empty())
}

impl CollectedComponent {
    fn into_job(self, id: String, screenshot_path: PathBuf, asset_dir: PathBuf) -> Option<RenderJob> {
        let source = first_non_empty(&[
            &self.code_with_ori_img,
            &self.debug_component,
            &self.raw_component,
        ])?;
        let style = first_non_empty(&[&self.filtered_css, &self.raw_css]).unwrap_or_default();
        let kind = first_non_empty(&[&self.file_type])
            .map(ComponentKind::from_label)
            .unwrap_or_default();

        Some(
            RenderJob::new(id, source, screenshot_path)
                .with_kind(kind)
                .with_style(style)
                .with_asset_dir(asset_dir),
        )
    }
}

async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let mut entries = fs::read_dir(dir).await.map_err(BatchError::io(dir))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(BatchError::io(dir))? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Load collected components from `<code_dir>/<repo>/<component>.json`
///
/// Components without any source are skipped. Screenshots are named
/// `<repo>-_-_-<component>.png` and the repository's `imgs/` directory is
/// staged as the job's assets.
pub async fn load_collected(
    code_dir: &Path,
    screenshot_dir: &Path,
) -> Result<Vec<RenderJob>, BatchError> {
    let mut jobs = Vec::new();

    for repo_dir in sorted_entries(code_dir).await? {
        if !repo_dir.is_dir() {
            continue;
        }
        let repo = file_name(&repo_dir);

        for file in sorted_entries(&repo_dir).await? {
            let is_json = file.extension().is_some_and(|ext| ext == "json");
            if !is_json || !file.is_file() || file_name(&file) == "package.json" {
                continue;
            }

            let name = file_name(&file);
            let component = name.split('.').next().unwrap_or(&name).to_string();
            let text = fs::read_to_string(&file).await.map_err(BatchError::io(&file))?;
            let collected: CollectedComponent =
                serde_json::from_str(&text).map_err(BatchError::json(&file))?;

            let id = format!("{}{}{}", repo, NAME_SEPARATOR, component);
            let screenshot = screenshot_dir.join(format!("{}.png", id));
            match collected.into_job(id, screenshot, repo_dir.join(paths::ASSETS_DIR)) {
                Some(job) => jobs.push(job),
                None => log::warn!("No component code found in {:?}", file),
            }
        }
    }

    log::info!("Loaded {} collected component(s) from {:?}", jobs.len(), code_dir);
    Ok(jobs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One generated result; `id` and `index` may be strings or numbers
#[derive(Debug, Deserialize)]
struct GeneratedResult {
    id: serde_json::Value,
    index: serde_json::Value,
    #[serde(default)]
    output: String,
    #[serde(default)]
    repeat: Option<u32>,
}

fn label(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn strip_css_marker(text: &str) -> &str {
    text.strip_prefix(CSS_MARKER).unwrap_or(text)
}

/// Split a generated output into `(style, kind, source)`
///
/// The earliest kind marker splits stylesheet from component. Without one,
/// the component starts at the first `import `. Returns `None` when no
/// component code can be found.
pub fn extract_component_code(output: &str) -> Option<(String, ComponentKind, String)> {
    let marker = KIND_MARKERS
        .iter()
        .filter_map(|(marker, kind)| output.find(marker).map(|at| (at, *marker, *kind)))
        .min_by_key(|(at, _, _)| *at);

    if let Some((at, marker, kind)) = marker {
        let style = strip_css_marker(output[..at].trim()).trim();
        let source = output[at + marker.len()..].trim();
        if !source.is_empty() {
            return Some((style.to_string(), kind, source.to_string()));
        }
    }

    let at = output.find("import ")?;
    let style = strip_css_marker(&output[..at]).trim();
    let source = output[at..].trim();
    if source.is_empty() {
        return None;
    }
    Some((style.to_string(), ComponentKind::Jsx, source.to_string()))
}

/// Load generated results from a JSON array of `{id, index, output, repeat}`
///
/// Screenshots are named `<id>_<index>_0.png`; repeats continue the numbering.
pub async fn load_generated(
    results_path: &Path,
    screenshot_dir: &Path,
) -> Result<Vec<RenderJob>, BatchError> {
    let text = fs::read_to_string(results_path)
        .await
        .map_err(BatchError::io(results_path))?;
    let results: Vec<GeneratedResult> =
        serde_json::from_str(&text).map_err(BatchError::json(results_path))?;
    log::info!("Got {} generated result(s)", results.len());

    let jobs: Vec<RenderJob> = results
        .into_iter()
        .filter_map(|result| {
            let id = format!("{}_{}", label(&result.id), label(&result.index));
            let Some((style, kind, source)) = extract_component_code(&result.output) else {
                log::debug!("No component code in result {}", id);
                return None;
            };
            let screenshot = screenshot_dir.join(format!("{}_0.png", id));
            let mut job = RenderJob::new(id, source, screenshot)
                .with_kind(kind)
                .with_style(style);
            job.repeat = result.repeat;
            Some(job)
        })
        .collect();

    Ok(jobs)
}

/// Split jobs into `ceil(len / batches)`-sized chunks, numbered from 1
pub fn partition(jobs: Vec<RenderJob>, batches: usize) -> Vec<(u16, Vec<RenderJob>)> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let size = jobs.len().div_ceil(batches.max(1));

    let mut out = Vec::new();
    let mut rest = jobs.into_iter().peekable();
    let mut index: u16 = 1;
    while rest.peek().is_some() {
        let chunk: Vec<RenderJob> = rest.by_ref().take(size).collect();
        out.push((index, chunk));
        index = index.saturating_add(1);
    }
    out
}
