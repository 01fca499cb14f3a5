//! Shared fakes for the render integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use component_render::{
    ChatRequest, ChatResponse, ChatService, PortReaper, ProcessEvent, ProcessHandle,
    ProcessSpawner, ReaperError, RenderConfig, Renderer, RendererSession, ScreenshotCapturer,
    SpawnSpec,
};

pub type Script = Vec<(Duration, ProcessEvent)>;

pub fn out(line: &str) -> ProcessEvent {
    ProcessEvent::Stdout(line.as_bytes().to_vec())
}

pub fn err(line: &str) -> ProcessEvent {
    ProcessEvent::Stderr(line.as_bytes().to_vec())
}

pub fn listening(port: u16) -> Script {
    vec![
        (Duration::from_millis(500), out("Starting the development server...")),
        (
            Duration::from_secs(5),
            out(&format!("  Local:            http://localhost:{}", port)),
        ),
    ]
}

pub fn syntax_error() -> Script {
    vec![
        (Duration::from_millis(500), err("SyntaxError: Unexpected token (3:10)")),
        (Duration::from_millis(100), ProcessEvent::Terminated(Some(1))),
    ]
}

/// Files in the components directory when a spawn happened
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub files: Vec<(String, String)>,
    pub dirs: Vec<String>,
}

impl Snapshot {
    fn take(dir: &Path) -> Self {
        let mut snapshot = Snapshot::default();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.path().is_dir() {
                    snapshot.dirs.push(name);
                } else {
                    let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
                    snapshot.files.push((name, content));
                }
            }
        }
        snapshot.files.sort();
        snapshot.dirs.sort();
        snapshot
    }

    pub fn file(&self, name: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.as_str())
    }
}

struct FakeHandle {
    terminations: Arc<AtomicUsize>,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        4242
    }

    fn terminate(&self) -> Result<(), String> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replays one script per spawn; after a script ends the channel stays open
#[derive(Default)]
pub struct FakeSpawner {
    scripts: Mutex<VecDeque<Script>>,
    pub spawns: Mutex<Vec<SpawnSpec>>,
    pub snapshots: Mutex<Vec<Snapshot>>,
    pub terminations: Arc<AtomicUsize>,
}

impl FakeSpawner {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().len()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>), String> {
        self.spawns.lock().push(spec.clone());
        self.snapshots
            .lock()
            .push(Snapshot::take(&spec.cwd.join("src/components")));

        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for (delay, event) in script {
                tokio::time::sleep(delay).await;
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        Ok((
            rx,
            Box::new(FakeHandle {
                terminations: self.terminations.clone(),
            }),
        ))
    }
}

/// Records cleared ports; can be switched to fail
#[derive(Default)]
pub struct FakeReaper {
    pub cleared: Mutex<Vec<u16>>,
    pub fail: AtomicBool,
}

impl FakeReaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn clear_count(&self) -> usize {
        self.cleared.lock().len()
    }
}

#[async_trait]
impl PortReaper for FakeReaper {
    async fn clear_port(&self, port: u16) -> Result<(), ReaperError> {
        self.cleared.lock().push(port);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReaperError::Kill {
                pid: 1,
                port,
                message: "operation not permitted".to_string(),
            });
        }
        Ok(())
    }
}

/// Answers with queued responses, then with no content
#[derive(Default)]
pub struct FakeChat {
    responses: Mutex<VecDeque<ChatResponse>>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeChat {
    pub fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl ChatService for FakeChat {
    async fn chat(&self, request: ChatRequest) -> ChatResponse {
        self.prompts.lock().push(request.prompt);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| ChatResponse::failed(403))
    }
}

/// Writes a fake PNG unless disabled
pub struct FakeCapturer {
    pub urls: Mutex<Vec<String>>,
    pub produce: AtomicBool,
}

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

impl FakeCapturer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            urls: Mutex::new(Vec::new()),
            produce: AtomicBool::new(true),
        })
    }

    pub fn failing() -> Arc<Self> {
        let capturer = Self::new();
        capturer.produce.store(false, Ordering::SeqCst);
        capturer
    }
}

#[async_trait]
impl ScreenshotCapturer for FakeCapturer {
    async fn capture(&self, url: &str, out_path: &Path) {
        self.urls.lock().push(url.to_string());
        if self.produce.load(Ordering::SeqCst) {
            std::fs::write(out_path, PNG_BYTES).unwrap();
        }
    }
}

/// Route renderer logs through the test harness (`RUST_LOG=debug` to see them)
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A renderer over fakes, with a template dir and a screenshot dir
pub struct Harness {
    pub renderer: Renderer,
    pub spawner: Arc<FakeSpawner>,
    pub reaper: Arc<FakeReaper>,
    pub chat: Arc<FakeChat>,
    pub capturer: Arc<FakeCapturer>,
    pub template: PathBuf,
    pub shots: PathBuf,
    _root: tempfile::TempDir,
}

impl Harness {
    pub async fn new(
        scripts: Vec<Script>,
        chat: Arc<FakeChat>,
        capturer: Arc<FakeCapturer>,
        config: RenderConfig,
    ) -> Self {
        init_logging();
        let root = tempfile::tempdir().unwrap();
        let template = root.path().join("t-1");
        let shots = root.path().join("shots");

        let spawner = FakeSpawner::new(scripts);
        let reaper = FakeReaper::new();
        let session = RendererSession::init(template.clone(), 44100, &config, reaper.as_ref())
            .await
            .unwrap();
        let renderer = Renderer::new(
            session,
            config,
            spawner.clone(),
            reaper.clone(),
            chat.clone(),
            capturer.clone(),
        );

        Self {
            renderer,
            spawner,
            reaper,
            chat,
            capturer,
            template,
            shots,
            _root: root,
        }
    }

    pub fn components_dir(&self) -> PathBuf {
        self.template.join("src/components")
    }

    pub fn components_empty(&self) -> bool {
        let dir = self.components_dir();
        dir.is_dir() && std::fs::read_dir(dir).unwrap().next().is_none()
    }
}
