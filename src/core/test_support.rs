// Shared fakes for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::ProgressScope;
use crate::core::http::{HeadInfo, HttpResponse, HttpTransport};
use crate::core::instance::InstalledInstance;
use crate::core::patch::PatchApplier;
use crate::core::update::GameLauncher;

/// In-memory HTTP server.
pub struct MockTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    texts: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    declared_lengths: Mutex<HashMap<String, u64>>,
    ranges: AtomicBool,
    head_delay: Mutex<Option<Duration>>,
    chunk_size: usize,
    head_calls: AtomicUsize,
    get_calls: AtomicUsize,
    text_calls: AtomicUsize,
    bytes_served: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            declared_lengths: Mutex::new(HashMap::new()),
            ranges: AtomicBool::new(true),
            head_delay: Mutex::new(None),
            chunk_size: 7,
            head_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            bytes_served: AtomicU64::new(0),
        }
    }

    pub fn add_file(&self, url: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
    }

    pub fn set_text(&self, url: &str, body: &str) {
        self.texts
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal_url(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    /// Report `length` in Content-Length regardless of the real body.
    pub fn declare_length(&self, url: &str, length: u64) {
        self.declared_lengths
            .lock()
            .unwrap()
            .insert(url.to_string(), length);
    }

    pub fn set_range_support(&self, enabled: bool) {
        self.ranges.store(enabled, Ordering::SeqCst);
    }

    pub fn set_head_delay(&self, delay: Duration) {
        *self.head_delay.lock().unwrap() = Some(delay);
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    fn is_failing(&self, url: &str) -> bool {
        self.failing.lock().unwrap().contains(url)
    }

    fn declared(&self, url: &str, actual: u64) -> u64 {
        self.declared_lengths
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(actual)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn head(&self, url: &str) -> UpdaterResult<HeadInfo> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.head_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_failing(url) {
            return Err(UpdaterError::Other(format!("connection refused: {url}")));
        }
        let len = self.files.lock().unwrap().get(url).map(|b| b.len() as u64);
        Ok(match len {
            Some(len) => HeadInfo {
                status: 200,
                content_length: Some(self.declared(url, len)),
            },
            None => HeadInfo {
                status: 404,
                content_length: None,
            },
        })
    }

    async fn get(&self, url: &str, range_start: Option<u64>) -> UpdaterResult<HttpResponse> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing(url) {
            return Err(UpdaterError::Other(format!("connection refused: {url}")));
        }
        let Some(data) = self.files.lock().unwrap().get(url).cloned() else {
            return Ok(HttpResponse {
                status: 404,
                content_length: None,
                body: stream::empty().boxed(),
            });
        };

        let total = data.len() as u64;
        let (status, body) = match range_start {
            Some(offset) if self.ranges.load(Ordering::SeqCst) => {
                if offset >= total {
                    return Ok(HttpResponse {
                        status: 416,
                        content_length: None,
                        body: stream::empty().boxed(),
                    });
                }
                (206, data[offset as usize..].to_vec())
            }
            _ => (200, data),
        };
        let content_length = if status == 200 {
            Some(self.declared(url, total))
        } else {
            Some(body.len() as u64)
        };

        self.bytes_served
            .fetch_add(body.len() as u64, Ordering::SeqCst);
        let chunks: Vec<UpdaterResult<Vec<u8>>> = body
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        Ok(HttpResponse {
            status,
            content_length,
            body: stream::iter(chunks).boxed(),
        })
    }

    async fn get_text(&self, url: &str, _timeout: Duration) -> UpdaterResult<String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing(url) {
            return Err(UpdaterError::DownloadFailed {
                url: url.to_string(),
                status: 503,
            });
        }
        self.texts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| UpdaterError::DownloadFailed {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Applier that "installs" by writing the client marker and a version
/// stamp, and remembers every artifact it was handed.
pub struct RecordingApplier {
    marker: PathBuf,
    applied: Mutex<Vec<PathBuf>>,
    fail_on: Mutex<Option<String>>,
    on_apply: Mutex<Option<Box<dyn Fn(&Path) + Send + Sync>>>,
}

impl RecordingApplier {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
            applied: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            on_apply: Mutex::new(None),
        }
    }

    /// Fail when the artifact file name contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn on_apply(&self, hook: impl Fn(&Path) + Send + Sync + 'static) {
        *self.on_apply.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn applied_names(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect()
    }
}

#[async_trait]
impl PatchApplier for RecordingApplier {
    async fn apply(
        &self,
        artifact: &Path,
        target_dir: &Path,
        progress: &ProgressScope<'_>,
    ) -> UpdaterResult<()> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let fail_on = self.fail_on.lock().unwrap().clone();
        if let Some(needle) = fail_on {
            if name.contains(&needle) {
                return Err(UpdaterError::PatchApplication(format!(
                    "tool exited with status 1 for {name}"
                )));
            }
        }
        if !artifact.exists() {
            return Err(UpdaterError::PatchApplication(format!(
                "artifact missing: {artifact:?}"
            )));
        }

        let marker = target_dir.join(&self.marker);
        if let Some(parent) = marker.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&marker, b"client").await?;
        tokio::fs::write(target_dir.join("applied.txt"), name.as_bytes()).await?;
        progress.report(1.0, None, None);

        self.applied.lock().unwrap().push(artifact.to_path_buf());
        let hook = self.on_apply.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            hook(artifact);
        }
        Ok(())
    }
}

/// Launcher that records launches and reports exit code 0.
#[derive(Default)]
pub struct NoopLauncher {
    launched: Mutex<Vec<PathBuf>>,
}

impl NoopLauncher {
    pub fn launched(&self) -> Vec<PathBuf> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl GameLauncher for NoopLauncher {
    async fn launch(&self, instance: &InstalledInstance) -> UpdaterResult<i32> {
        self.launched.lock().unwrap().push(instance.path.clone());
        Ok(0)
    }
}
