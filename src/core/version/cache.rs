// ─── Version Cache ───
// Persisted `versions.json` snapshot, keyed by platform and aged per branch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::platform::Platform;

use super::branch::{Branch, VersionNumber};

pub const VERSION_CACHE_FILE: &str = "versions.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionCacheSnapshot {
    pub os: String,
    pub arch: String,
    /// Time of the most recent refresh of any branch.
    pub fetched_at: DateTime<Utc>,
    /// Refresh time of each branch; freshness is judged per branch so a
    /// merged snapshot never makes an old branch look new.
    #[serde(default)]
    pub branch_fetched_at: BTreeMap<Branch, DateTime<Utc>>,
    /// Descending, duplicate-free.
    #[serde(default)]
    pub versions: BTreeMap<Branch, Vec<VersionNumber>>,
    #[serde(default)]
    pub mirror_sourced_branches: BTreeSet<Branch>,
    /// filename -> url, per branch, as last seen on the mirror.
    #[serde(default)]
    pub mirror_urls: BTreeMap<Branch, BTreeMap<String, String>>,
}

impl VersionCacheSnapshot {
    pub fn empty(platform: &Platform) -> Self {
        Self {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            fetched_at: Utc::now(),
            branch_fetched_at: BTreeMap::new(),
            versions: BTreeMap::new(),
            mirror_sourced_branches: BTreeSet::new(),
            mirror_urls: BTreeMap::new(),
        }
    }

    pub fn matches_platform(&self, platform: &Platform) -> bool {
        self.os == platform.os && self.arch == platform.arch
    }

    /// Cached list for `branch`, or why it cannot be used.
    pub fn fresh_versions(
        &self,
        platform: &Platform,
        branch: Branch,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> UpdaterResult<&[VersionNumber]> {
        if !self.matches_platform(platform) {
            return Err(UpdaterError::CacheInvalid(format!(
                "cached for {}/{}, running on {}",
                self.os, self.arch, platform
            )));
        }
        let fetched_at = self
            .branch_fetched_at
            .get(&branch)
            .copied()
            .unwrap_or(self.fetched_at);
        if now.signed_duration_since(fetched_at) >= ttl {
            return Err(UpdaterError::CacheInvalid(format!(
                "{branch} entry older than {}s",
                ttl.num_seconds()
            )));
        }
        match self.versions.get(&branch) {
            Some(list) if !list.is_empty() => Ok(list.as_slice()),
            _ => Err(UpdaterError::CacheInvalid(format!("no entry for {branch}"))),
        }
    }

    /// Record a refreshed branch, leaving the other branches untouched.
    pub fn merge_branch(
        &mut self,
        branch: Branch,
        versions: Vec<VersionNumber>,
        mirror_sourced: bool,
        mirror_urls: Option<BTreeMap<String, String>>,
        now: DateTime<Utc>,
    ) {
        self.fetched_at = now;
        self.branch_fetched_at.insert(branch, now);
        self.versions.insert(branch, normalize_versions(versions));
        if mirror_sourced {
            self.mirror_sourced_branches.insert(branch);
        } else {
            self.mirror_sourced_branches.remove(&branch);
        }
        if let Some(urls) = mirror_urls {
            self.mirror_urls.insert(branch, urls);
        }
    }

    pub async fn load(path: &Path) -> Option<Self> {
        let raw = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice::<Self>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Corrupt version cache at {:?}: {}", path, e);
                None
            }
        }
    }

    /// Write via a temp file + rename so readers never see a torn file.
    pub async fn save(&self, path: &Path) -> UpdaterResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdaterError::io(parent, e))?;
        }
        let payload = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| UpdaterError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| UpdaterError::io(path, e))?;
        debug!("Persisted version cache to {:?}", path);
        Ok(())
    }
}

/// Sort descending and drop duplicates and the `0` sentinel.
pub fn normalize_versions(mut versions: Vec<VersionNumber>) -> Vec<VersionNumber> {
    versions.retain(|v| *v > 0);
    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions.dedup();
    versions
}
