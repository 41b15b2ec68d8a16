use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::cancel::CancellationSignal;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::ProgressScope;
use crate::core::http::HttpTransport;

const PARTIAL_SUFFIX: &str = "part";

/// One file transfer: where from, where to, and how much is already on disk.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub resume_offset_bytes: u64,
    pub total_size_bytes: Option<u64>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            resume_offset_bytes: 0,
            total_size_bytes: None,
        }
    }

    /// Sibling file the bytes are streamed into until the transfer is verified.
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.destination)
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes pulled over the network in this attempt.
    pub bytes_transferred: u64,
    /// Final on-disk size.
    pub total_bytes: u64,
    /// Offset the attempt resumed from (0 for a fresh transfer).
    pub resumed_from: u64,
}

/// Whether `fetch_cached` had to hit the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFetch {
    Reused { size: u64 },
    Downloaded(DownloadReport),
}

/// Resumable, retrying, size-verified downloader.
pub struct DownloadManager {
    transport: Arc<dyn HttpTransport>,
    max_attempts: u32,
    retry_backoff: Duration,
    progress_interval: Duration,
}

impl DownloadManager {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            max_attempts: 5,
            retry_backoff: Duration::from_millis(750),
            progress_interval: Duration::from_millis(100),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    // ── Remote metadata ─────────────────────────────────

    /// Server-reported size, `None` when unknown or unreachable.
    pub async fn get_remote_size(&self, url: &str) -> Option<u64> {
        match self.transport.head(url).await {
            Ok(head) if head.exists() => head.content_length,
            Ok(head) => {
                debug!("HEAD {} -> {}", url, head.status);
                None
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                None
            }
        }
    }

    // ── Single attempt ──────────────────────────────────

    /// Download `url` into `dest`, resuming a `.part` file when one exists.
    ///
    /// The body is streamed into `<dest>.part`; only once its size matches
    /// the server-reported length is it renamed to `dest`. Cancellation is
    /// observed per chunk.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressScope<'_>,
        cancel: &CancellationSignal,
    ) -> UpdaterResult<DownloadReport> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdaterError::io(parent, e))?;
        }

        let mut task = DownloadTask::new(url, dest);
        let part = task.partial_path();
        task.resume_offset_bytes = tokio::fs::metadata(&part)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        cancel.check()?;

        let range = (task.resume_offset_bytes > 0).then_some(task.resume_offset_bytes);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            response = self.transport.get(url, range) => response?,
        };

        let (mut file, start) = match response.status {
            206 if task.resume_offset_bytes > 0 => {
                debug!("Resuming {} at byte {}", url, task.resume_offset_bytes);
                task.total_size_bytes = response
                    .content_length
                    .map(|len| len + task.resume_offset_bytes);
                let file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&part)
                    .await
                    .map_err(|e| UpdaterError::io(&part, e))?;
                (file, task.resume_offset_bytes)
            }
            416 if task.resume_offset_bytes > 0 => {
                // Partial file is at or past the end; start over next attempt.
                remove_if_exists(&part).await?;
                return Err(UpdaterError::DownloadFailed {
                    url: url.to_string(),
                    status: 416,
                });
            }
            status if (200..300).contains(&status) => {
                if task.resume_offset_bytes > 0 {
                    debug!("Server ignored range for {}, restarting", url);
                }
                task.total_size_bytes = response.content_length;
                let file = tokio::fs::File::create(&part)
                    .await
                    .map_err(|e| UpdaterError::io(&part, e))?;
                (file, 0)
            }
            status => {
                return Err(UpdaterError::DownloadFailed {
                    url: url.to_string(),
                    status,
                })
            }
        };

        let mut body = response.body;
        let mut written = start;
        let mut last_report = Instant::now();
        progress.report(fraction(written, task.total_size_bytes), Some(written), task.total_size_bytes);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(UpdaterError::Cancelled);
                }
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Keep what we have; the next attempt resumes from it.
                    let _ = file.flush().await;
                    return Err(e);
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| UpdaterError::io(&part, e))?;
            written += chunk.len() as u64;

            if last_report.elapsed() >= self.progress_interval {
                progress.report(
                    fraction(written, task.total_size_bytes),
                    Some(written),
                    task.total_size_bytes,
                );
                last_report = Instant::now();
            }
        }

        // Flush and drop the handle before renaming (Windows keeps it locked).
        {
            file.flush().await.map_err(|e| UpdaterError::io(&part, e))?;
            file.sync_all().await.map_err(|e| UpdaterError::io(&part, e))?;
        }
        drop(file);

        let actual = tokio::fs::metadata(&part)
            .await
            .map_err(|e| UpdaterError::io(&part, e))?
            .len();
        if let Some(expected) = task.total_size_bytes {
            if actual != expected {
                if actual > expected {
                    remove_if_exists(&part).await?;
                }
                return Err(UpdaterError::SizeMismatch {
                    path: dest.to_path_buf(),
                    expected,
                    actual,
                });
            }
        }

        remove_if_exists(dest).await?;
        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| UpdaterError::io(dest, e))?;
        progress.report(1.0, Some(actual), Some(actual));

        debug!("Downloaded: {} -> {:?} ({} bytes)", url, dest, actual);
        Ok(DownloadReport {
            bytes_transferred: actual - start,
            total_bytes: actual,
            resumed_from: start,
        })
    }

    // ── Retry ───────────────────────────────────────────

    /// Bounded-attempt wrapper around [`download_to_file`]. Every retry
    /// resumes from whatever the failed attempt left behind; a size
    /// mismatch discards the partial file first.
    ///
    /// [`download_to_file`]: Self::download_to_file
    pub async fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressScope<'_>,
        cancel: &CancellationSignal,
    ) -> UpdaterResult<DownloadReport> {
        let mut attempt = 1;
        loop {
            match self.download_to_file(url, dest, progress, cancel).await {
                Ok(report) => return Ok(report),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "Download attempt {}/{} for {} failed: {}",
                        attempt, self.max_attempts, url, e
                    );
                    if matches!(e, UpdaterError::SizeMismatch { .. }) {
                        remove_if_exists(&partial_path(dest)).await?;
                    }
                    let backoff = self.retry_backoff * attempt;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Cached artifacts ────────────────────────────────

    /// Reuse `dest` when its size equals the server-reported size; otherwise
    /// delete it and download again.
    pub async fn fetch_cached(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        progress: &ProgressScope<'_>,
        cancel: &CancellationSignal,
    ) -> UpdaterResult<CachedFetch> {
        if let Ok(meta) = tokio::fs::metadata(dest).await {
            let local = meta.len();
            let remote = match expected_size {
                Some(size) => Some(size),
                None => self.get_remote_size(url).await,
            };
            match remote {
                Some(remote) if remote == local => {
                    info!("Reusing cached artifact {:?} ({} bytes)", dest, local);
                    progress.report(1.0, Some(local), Some(local));
                    return Ok(CachedFetch::Reused { size: local });
                }
                Some(remote) => warn!(
                    "Cached artifact {:?} is {} bytes, server reports {}; refetching",
                    dest, local, remote
                ),
                None => warn!("Cannot verify cached artifact {:?}; refetching", dest),
            }
            remove_if_exists(dest).await?;
        }

        let report = self.download_with_retry(url, dest, progress, cancel).await?;
        Ok(CachedFetch::Downloaded(report))
    }
}

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

fn fraction(done: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (done as f64 / total as f64) as f32,
        _ => 0.0,
    }
}

async fn remove_if_exists(path: &Path) -> UpdaterResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdaterError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancellationSource;
    use crate::core::events::{EventSink, ProgressBand, ProgressStage, UpdateEvent};
    use crate::core::test_support::MockTransport;

    const URL: &str = "https://patches.example/patches/linux/amd64/release/0/3.pwr";

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn manager(transport: Arc<MockTransport>) -> DownloadManager {
        DownloadManager::new(transport)
            .with_retry(5, Duration::from_millis(1))
            .with_progress_interval(Duration::ZERO)
    }

    fn scope(sink: &EventSink) -> ProgressScope<'_> {
        ProgressScope::new(
            sink,
            ProgressStage::Download,
            "progress.downloading",
            ProgressBand::new(5.0, 65.0),
        )
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/cache/release_0_3.pwr")),
            PathBuf::from("/cache/release_0_3.pwr.part")
        );
    }

    #[tokio::test]
    async fn fresh_download_writes_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        let sink = EventSink::disabled();

        let report = manager(transport.clone())
            .download_to_file(URL, &dest, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert_eq!(report.bytes_transferred, 1000);
        assert_eq!(report.resumed_from, 0);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn resume_transfers_only_the_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        std::fs::write(partial_path(&dest), &payload()[..400]).unwrap();
        let sink = EventSink::disabled();

        let report = manager(transport.clone())
            .download_to_file(URL, &dest, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert_eq!(report.resumed_from, 400);
        assert_eq!(report.bytes_transferred, 600);
        assert_eq!(transport.bytes_served(), 600);
    }

    #[tokio::test]
    async fn server_without_ranges_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        transport.set_range_support(false);
        let dest = dir.path().join("release_0_3.pwr");
        std::fs::write(partial_path(&dest), b"garbage-prefix").unwrap();
        let sink = EventSink::disabled();

        let report = manager(transport.clone())
            .download_to_file(URL, &dest, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert_eq!(report.resumed_from, 0);
        assert_eq!(transport.bytes_served(), 1000);
    }

    #[tokio::test]
    async fn short_body_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        transport.declare_length(URL, 5000);
        let dest = dir.path().join("release_0_3.pwr");
        let sink = EventSink::disabled();

        let err = manager(transport)
            .download_with_retry(URL, &dest, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpdaterError::SizeMismatch {
                expected: 5000,
                actual: 1000,
                ..
            }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        transport.fail_url(URL);
        let dest = dir.path().join("release_0_3.pwr");
        let sink = EventSink::disabled();
        let downloads = manager(transport.clone());

        let progress = scope(&sink);
        let cancel = CancellationSignal::never();

        let healer = transport.clone();
        let (result, _) = tokio::join!(
            downloads.download_with_retry(URL, &dest, &progress, &cancel),
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                healer.heal_url(URL);
            }
        );

        result.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert!(transport.get_calls() >= 2);
    }

    #[tokio::test]
    async fn matching_cached_artifact_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        std::fs::write(&dest, payload()).unwrap();
        let sink = EventSink::disabled();

        let fetched = manager(transport.clone())
            .fetch_cached(URL, &dest, None, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        assert_eq!(fetched, CachedFetch::Reused { size: 1000 });
        assert_eq!(transport.get_calls(), 0);
    }

    #[tokio::test]
    async fn mismatched_cached_artifact_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        std::fs::write(&dest, b"stale and short").unwrap();
        let sink = EventSink::disabled();

        let fetched = manager(transport.clone())
            .fetch_cached(URL, &dest, None, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        assert!(matches!(fetched, CachedFetch::Downloaded(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert_eq!(transport.get_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_download_keeps_nothing_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        let sink = EventSink::disabled();
        let source = CancellationSource::new();
        source.cancel();

        let err = manager(transport)
            .download_with_retry(URL, &dest, &scope(&sink), &source.signal())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn progress_events_stay_inside_band() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_file(URL, &payload());
        let dest = dir.path().join("release_0_3.pwr");
        let (sink, mut rx) = EventSink::channel();

        manager(transport)
            .download_to_file(URL, &dest, &scope(&sink), &CancellationSignal::never())
            .await
            .unwrap();

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UpdateEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert!(!percents.is_empty());
        assert!(percents.iter().all(|p| (5..=65).contains(p)));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*percents.last().unwrap(), 65);
    }
}
