// ─── Mirror Resolver ───
// Secondary artifact source, consulted when the primary patch server has
// no versions or fails a download. Keeps a short-lived in-memory index and
// falls back to stale data (or URL maps persisted in the version cache) so
// repeat operations keep working offline.

pub mod index;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::http::HttpTransport;
use crate::core::platform::Platform;
use crate::core::version::{Branch, VersionNumber};

pub use index::{
    available_versions, diff_artifact_name, full_artifact_name, parse_artifact_name,
    MirrorArtifact, MirrorIndex,
};

pub const DEFAULT_MIRROR_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MIRROR_TIMEOUT: Duration = Duration::from_secs(15);

struct CachedIndex {
    index: Arc<MirrorIndex>,
    fetched_at: Instant,
}

pub struct MirrorResolver {
    transport: Arc<dyn HttpTransport>,
    index_url: String,
    ttl: Duration,
    timeout: Duration,
    /// Also serializes index fetches.
    cached: Mutex<Option<CachedIndex>>,
    /// filename -> url maps restored from the persisted version cache.
    fallback: RwLock<HashMap<Branch, BTreeMap<String, String>>>,
}

impl MirrorResolver {
    pub fn new(transport: Arc<dyn HttpTransport>, index_url: impl Into<String>) -> Self {
        Self {
            transport,
            index_url: index_url.into(),
            ttl: DEFAULT_MIRROR_TTL,
            timeout: DEFAULT_MIRROR_TIMEOUT,
            cached: Mutex::new(None),
            fallback: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // ── Lookups ─────────────────────────────────────────

    pub async fn get_full_url(
        &self,
        platform: &Platform,
        branch: Branch,
        version: VersionNumber,
    ) -> Option<String> {
        let name = full_artifact_name(version, platform);
        self.url_map(platform, branch).await?.get(&name).cloned()
    }

    pub async fn get_diff_url(
        &self,
        platform: &Platform,
        branch: Branch,
        from: VersionNumber,
        to: VersionNumber,
    ) -> Option<String> {
        let urls = self.url_map(platform, branch).await?;
        if let Some(url) = urls.get(&diff_artifact_name(from, to, platform)) {
            return Some(url.clone());
        }
        // The first link of a chain may be published as a plain v1 snapshot.
        if from == 0 {
            return urls.get(&full_artifact_name(to, platform)).cloned();
        }
        None
    }

    pub async fn list_available_versions(
        &self,
        platform: &Platform,
        branch: Branch,
    ) -> UpdaterResult<Vec<VersionNumber>> {
        let urls = self.url_map(platform, branch).await.ok_or_else(|| {
            UpdaterError::MirrorUnavailable(format!("no {branch} entries for {}", platform.key()))
        })?;
        let versions = available_versions(urls.keys(), platform, branch.storage_shape());
        debug!(
            "Mirror lists {} {} versions for {}",
            versions.len(),
            branch,
            platform
        );
        Ok(versions)
    }

    /// filename -> url entries for one branch/platform: live or stale index
    /// first, persisted fallback second.
    pub async fn url_map(
        &self,
        platform: &Platform,
        branch: Branch,
    ) -> Option<BTreeMap<String, String>> {
        if let Some(index) = self.index().await {
            if let Some(entries) = index.entries(branch, platform) {
                return Some(entries.clone());
            }
        }

        let fallback = self.fallback.read().ok()?;
        let urls = fallback.get(&branch)?;
        let filtered: BTreeMap<String, String> = urls
            .iter()
            .filter(|(name, _)| parse_artifact_name(name, platform).is_some())
            .map(|(name, url)| (name.clone(), url.clone()))
            .collect();
        if filtered.is_empty() {
            None
        } else {
            debug!("Using persisted mirror URLs for {}", branch);
            Some(filtered)
        }
    }

    /// Restore URL maps persisted by the version catalog.
    pub fn seed_fallback(&self, branch: Branch, urls: BTreeMap<String, String>) {
        if urls.is_empty() {
            return;
        }
        if let Ok(mut fallback) = self.fallback.write() {
            fallback.insert(branch, urls);
        }
    }

    /// Drop the in-memory index so the next lookup refetches.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    // ── Index fetch ─────────────────────────────────────

    async fn index(&self) -> Option<Arc<MirrorIndex>> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Some(entry.index.clone());
            }
        }

        match self.fetch_index().await {
            Ok(index) => {
                let index = Arc::new(index);
                *cached = Some(CachedIndex {
                    index: index.clone(),
                    fetched_at: Instant::now(),
                });
                Some(index)
            }
            Err(e) => {
                warn!("Mirror index fetch failed: {}", e);
                cached.as_ref().map(|entry| {
                    info!("Serving stale mirror index");
                    entry.index.clone()
                })
            }
        }
    }

    async fn fetch_index(&self) -> UpdaterResult<MirrorIndex> {
        debug!("Fetching mirror index from {}", self.index_url);
        let body = self.transport.get_text(&self.index_url, self.timeout).await?;
        let index: MirrorIndex = serde_json::from_str(&body)?;
        Ok(index)
    }
}
