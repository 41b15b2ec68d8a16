// ─── Version Catalog ───
// Discovers which versions the patch server offers for a branch by probing
// a deterministic URL template, caches the result per platform with a TTL,
// and falls back to the mirror when the primary server lists nothing.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::http::HttpTransport;
use crate::core::mirror::MirrorResolver;
use crate::core::platform::Platform;

use super::branch::{Branch, VersionNumber};
use super::cache::{normalize_versions, VersionCacheSnapshot, VERSION_CACHE_FILE};

/// Probe tuning.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub concurrency: usize,
    pub batch_size: u32,
    /// Consecutive missing versions that end the scan.
    pub miss_limit: u32,
    /// Hard stop for servers that answer "exists" to everything.
    pub ceiling: VersionNumber,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_size: 20,
            miss_limit: 20,
            ceiling: 2000,
        }
    }
}

/// `{patch_host}/patches/{os}/{arch}/{branch}/{from}/{to}.pwr`
pub fn patch_url(
    patch_host: &str,
    platform: &Platform,
    branch: Branch,
    from: VersionNumber,
    to: VersionNumber,
) -> String {
    format!(
        "{}/patches/{}/{}/{}/{}/{}.pwr",
        patch_host.trim_end_matches('/'),
        platform.os,
        platform.arch,
        branch.as_str(),
        from,
        to
    )
}

pub struct VersionCatalog {
    transport: Arc<dyn HttpTransport>,
    mirror: Arc<MirrorResolver>,
    patch_host: String,
    platform: Platform,
    cache_path: PathBuf,
    ttl: chrono::Duration,
    probe: ProbeConfig,
    /// Serializes refreshes: one network fetch per cold cache.
    refresh_lock: Mutex<()>,
    snapshot: RwLock<Option<VersionCacheSnapshot>>,
    /// Branches served from the mirror during this process lifetime.
    mirror_sourced: StdMutex<HashSet<Branch>>,
}

impl VersionCatalog {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        mirror: Arc<MirrorResolver>,
        patch_host: impl Into<String>,
        platform: Platform,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            transport,
            mirror,
            patch_host: patch_host.into(),
            platform,
            cache_path: cache_dir.join(VERSION_CACHE_FILE),
            ttl: chrono::Duration::hours(1),
            probe: ProbeConfig::default(),
            refresh_lock: Mutex::new(()),
            snapshot: RwLock::new(None),
            mirror_sourced: StdMutex::new(HashSet::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        self
    }

    pub fn with_probe_config(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn patch_host(&self) -> &str {
        &self.patch_host
    }

    /// Primary-server URL of the `from -> to` artifact.
    pub fn primary_patch_url(&self, branch: Branch, from: VersionNumber, to: VersionNumber) -> String {
        patch_url(&self.patch_host, &self.platform, branch, from, to)
    }

    pub fn is_mirror_sourced(&self, branch: Branch) -> bool {
        self.mirror_sourced
            .lock()
            .map(|set| set.contains(&branch))
            .unwrap_or(false)
    }

    /// Descending, duplicate-free versions available for `branch`.
    #[instrument(skip(self), fields(platform = %self.platform))]
    pub async fn list_versions(&self, branch: Branch) -> UpdaterResult<Vec<VersionNumber>> {
        if let Some(cached) = self.cached_versions(branch).await {
            return Ok(cached);
        }

        let _refresh = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(cached) = self.cached_versions(branch).await {
            debug!("Version cache refreshed by a concurrent caller");
            return Ok(cached);
        }

        self.refresh(branch).await
    }

    /// Newest available version.
    pub async fn latest_version(&self, branch: Branch) -> UpdaterResult<VersionNumber> {
        self.list_versions(branch)
            .await?
            .first()
            .copied()
            .ok_or(UpdaterError::NoVersionsAvailable(branch))
    }

    /// Forget the cached snapshot (memory and disk) so the next call probes.
    pub async fn invalidate(&self) -> UpdaterResult<()> {
        let _refresh = self.refresh_lock.lock().await;
        *self.snapshot.write().await = None;
        match tokio::fs::remove_file(&self.cache_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdaterError::io(&self.cache_path, e)),
        }
    }

    // ── Cache ───────────────────────────────────────────

    async fn cached_versions(&self, branch: Branch) -> Option<Vec<VersionNumber>> {
        let now = Utc::now();
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                match snapshot.fresh_versions(&self.platform, branch, self.ttl, now) {
                    Ok(list) => return Some(list.to_vec()),
                    Err(e) => debug!("{}", e),
                }
            }
        }

        let loaded = VersionCacheSnapshot::load(&self.cache_path).await?;
        if !loaded.matches_platform(&self.platform) {
            debug!(
                "Ignoring version cache for {}/{} on {}",
                loaded.os, loaded.arch, self.platform
            );
            return None;
        }

        self.restore_mirror_state(&loaded, now);
        let fresh = match loaded.fresh_versions(&self.platform, branch, self.ttl, now) {
            Ok(list) => Some(list.to_vec()),
            Err(e) => {
                debug!("{}", e);
                None
            }
        };
        *self.snapshot.write().await = Some(loaded);
        fresh
    }

    /// Seed offline mirror URLs, and carry the mirror-sourced flag over only
    /// for branches whose cached list is still fresh.
    fn restore_mirror_state(&self, snapshot: &VersionCacheSnapshot, now: DateTime<Utc>) {
        for (branch, urls) in &snapshot.mirror_urls {
            self.mirror.seed_fallback(*branch, urls.clone());
        }
        if let Ok(mut set) = self.mirror_sourced.lock() {
            set.extend(snapshot.mirror_sourced_branches.iter().copied().filter(|branch| {
                snapshot
                    .fresh_versions(&self.platform, *branch, self.ttl, now)
                    .is_ok()
            }));
        }
    }

    fn set_mirror_sourced(&self, branch: Branch, sourced: bool) {
        if let Ok(mut set) = self.mirror_sourced.lock() {
            if sourced {
                set.insert(branch);
            } else {
                set.remove(&branch);
            }
        }
    }

    // ── Refresh ─────────────────────────────────────────

    async fn refresh(&self, branch: Branch) -> UpdaterResult<Vec<VersionNumber>> {
        info!("Refreshing {} versions from {}", branch, self.patch_host);
        let probed = self.probe_versions(branch).await;

        let (versions, from_mirror, mirror_urls) = if probed.is_empty() {
            warn!("Primary server lists no {} versions, asking mirror", branch);
            let mirrored = self
                .mirror
                .list_available_versions(&self.platform, branch)
                .await
                .unwrap_or_else(|e| {
                    warn!("Mirror listing failed: {}", e);
                    Vec::new()
                });
            if mirrored.is_empty() {
                return Err(UpdaterError::NoVersionsAvailable(branch));
            }
            self.set_mirror_sourced(branch, true);
            let urls = self.mirror.url_map(&self.platform, branch).await;
            (mirrored, true, urls)
        } else {
            self.set_mirror_sourced(branch, false);
            (probed, false, None)
        };

        let versions = normalize_versions(versions);
        self.persist(branch, versions.clone(), from_mirror, mirror_urls)
            .await;
        info!("{} {} versions available, newest {:?}", versions.len(), branch, versions.first());
        Ok(versions)
    }

    /// Ascending scan from version 1 in bounded-concurrency batches, stopping
    /// after `miss_limit` consecutive absent versions. Network errors count
    /// as absent.
    async fn probe_versions(&self, branch: Branch) -> Vec<VersionNumber> {
        let ProbeConfig {
            concurrency,
            batch_size,
            miss_limit,
            ceiling,
        } = self.probe.clone();

        let mut found = Vec::new();
        let mut misses = 0_u32;
        let mut start: VersionNumber = 1;

        'scan: while start <= ceiling {
            let end = start.saturating_add(batch_size.max(1) - 1).min(ceiling);
            let mut batch: Vec<(VersionNumber, bool)> = stream::iter(start..=end)
                .map(|version| async move { (version, self.version_exists(branch, version).await) })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
            batch.sort_unstable_by_key(|(version, _)| *version);

            for (version, exists) in batch {
                if exists {
                    found.push(version);
                    misses = 0;
                } else {
                    misses += 1;
                    if misses >= miss_limit {
                        break 'scan;
                    }
                }
            }
            start = end.saturating_add(1);
            if end == ceiling {
                break;
            }
        }

        debug!("Probe found {} {} versions", found.len(), branch);
        found
    }

    async fn version_exists(&self, branch: Branch, version: VersionNumber) -> bool {
        let url = self.primary_patch_url(branch, 0, version);
        match self.transport.head(&url).await {
            Ok(head) => head.exists(),
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                false
            }
        }
    }

    async fn persist(
        &self,
        branch: Branch,
        versions: Vec<VersionNumber>,
        mirror_sourced: bool,
        mirror_urls: Option<BTreeMap<String, String>>,
    ) {
        let mut guard = self.snapshot.write().await;
        let mut snapshot = match guard.take() {
            Some(existing) if existing.matches_platform(&self.platform) => existing,
            _ => match VersionCacheSnapshot::load(&self.cache_path).await {
                Some(existing) if existing.matches_platform(&self.platform) => existing,
                _ => VersionCacheSnapshot::empty(&self.platform),
            },
        };
        snapshot.merge_branch(branch, versions, mirror_sourced, mirror_urls, Utc::now());

        if let Err(e) = snapshot.save(&self.cache_path).await {
            warn!("Could not persist version cache: {}", e);
        }
        *guard = Some(snapshot);
    }
}
