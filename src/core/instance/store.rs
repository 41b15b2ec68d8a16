use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::model::{
    client_marker, slot_key, InstalledInstance, LatestPointer, LATEST_DIR, USER_DATA_DIR,
};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::version::{Branch, VersionNumber, LATEST_VERSION};

const INSTANCES_MANIFEST: &str = "instances.json";
const LATEST_POINTER_FILE: &str = "latest.json";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Custom names keyed by slot (`release/latest`, `release/7`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InstanceManifest {
    #[serde(default)]
    names: BTreeMap<String, String>,
}

/// Tracks installed instances on disk.
pub struct InstanceStore {
    /// Root directory where all branches live.
    root: PathBuf,
    /// Client marker, relative to an instance directory.
    marker: PathBuf,
    /// One lock per bookkeeping file.
    file_locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl InstanceStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            marker: client_marker(),
            file_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    // ── Paths ───────────────────────────────────────────

    /// `{root}/{branch}/{version}`; version 0 maps to `{root}/{branch}/latest`.
    pub fn resolve_path(&self, branch: Branch, version: VersionNumber) -> PathBuf {
        let branch_dir = self.branch_dir(branch);
        if version == LATEST_VERSION {
            branch_dir.join(LATEST_DIR)
        } else {
            branch_dir.join(version.to_string())
        }
    }

    pub fn staging_path(&self, branch: Branch, version: VersionNumber) -> PathBuf {
        self.branch_dir(branch)
            .join(format!("{STAGING_PREFIX}{}", slot_name(version)))
    }

    fn branch_dir(&self, branch: Branch) -> PathBuf {
        self.root.join(branch.as_str())
    }

    fn latest_pointer_path(&self, branch: Branch) -> PathBuf {
        self.branch_dir(branch).join(LATEST_POINTER_FILE)
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(INSTANCES_MANIFEST)
    }

    // ── Queries ─────────────────────────────────────────

    /// Installed means the client marker exists; bookkeeping alone never counts.
    pub async fn is_installed(&self, branch: Branch, version: VersionNumber) -> bool {
        has_marker(&self.resolve_path(branch, version), &self.marker).await
    }

    pub async fn get(&self, branch: Branch, version: VersionNumber) -> Option<InstalledInstance> {
        if !self.is_installed(branch, version).await {
            return None;
        }
        let mut instance =
            InstalledInstance::new(branch, version, self.resolve_path(branch, version));
        instance.custom_name = self
            .read_manifest()
            .await
            .names
            .get(&slot_key(branch, version))
            .cloned();
        Some(instance)
    }

    /// All installed instances, latest first within each branch.
    pub async fn list(&self) -> UpdaterResult<Vec<InstalledInstance>> {
        let manifest = self.read_manifest().await;
        let mut instances = Vec::new();

        for branch in Branch::ALL {
            let branch_dir = self.branch_dir(branch);
            let mut entries = match tokio::fs::read_dir(&branch_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(UpdaterError::io(&branch_dir, e)),
            };

            let mut found = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| UpdaterError::io(&branch_dir, e))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(version) = parse_slot_name(&name) else {
                    continue;
                };
                let path = entry.path();
                if !has_marker(&path, &self.marker).await {
                    continue;
                }
                let mut instance = InstalledInstance::new(branch, version, path);
                instance.custom_name = manifest.names.get(&slot_key(branch, version)).cloned();
                found.push(instance);
            }

            // latest (0) first, then newest pinned versions.
            found.sort_by_key(|i| (!i.is_latest, std::cmp::Reverse(i.version)));
            instances.extend(found);
        }

        Ok(instances)
    }

    pub async fn read_latest_pointer(&self, branch: Branch) -> Option<LatestPointer> {
        let path = self.latest_pointer_path(branch);
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<LatestPointer>(&raw) {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                warn!("Corrupt {:?}: {}", path, e);
                None
            }
        }
    }

    /// Version held by the latest instance: bookkeeping first, then the
    /// cached-artifact filename heuristic.
    pub async fn installed_latest_version(
        &self,
        branch: Branch,
        cache_dir: &Path,
    ) -> Option<VersionNumber> {
        if let Some(pointer) = self.read_latest_pointer(branch).await {
            return Some(pointer.version);
        }
        let guessed = guess_version_from_cache(cache_dir, branch).await;
        if let Some(version) = guessed {
            warn!(
                "No {} for {}, guessed v{} from cached artifacts",
                LATEST_POINTER_FILE, branch, version
            );
        }
        guessed
    }

    // ── Mutations ───────────────────────────────────────

    pub async fn record_latest_version(
        &self,
        branch: Branch,
        version: VersionNumber,
    ) -> UpdaterResult<()> {
        let path = self.latest_pointer_path(branch);
        let _guard = self.lock_file(&path).await;
        let pointer = LatestPointer {
            branch,
            version,
            updated_at: Utc::now(),
        };
        write_json_atomic(&path, &pointer).await?;
        debug!("Recorded {} latest = v{}", branch, version);
        Ok(())
    }

    pub async fn set_custom_name(
        &self,
        branch: Branch,
        version: VersionNumber,
        name: Option<String>,
    ) -> UpdaterResult<()> {
        if !self.resolve_path(branch, version).exists() {
            return Err(UpdaterError::InstanceNotFound(slot_key(branch, version)));
        }
        let path = self.manifest_path();
        let _guard = self.lock_file(&path).await;
        let mut manifest = self.read_manifest().await;
        let key = slot_key(branch, version);
        match name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            Some(name) => {
                manifest.names.insert(key, name);
            }
            None => {
                manifest.names.remove(&key);
            }
        }
        write_json_atomic(&path, &manifest).await
    }

    /// Remove one instance's directory tree and bookkeeping. Siblings are
    /// left untouched.
    pub async fn delete(&self, branch: Branch, version: VersionNumber) -> UpdaterResult<()> {
        let instance_dir = self.resolve_path(branch, version);
        if !instance_dir.exists() {
            return Err(UpdaterError::InstanceNotFound(slot_key(branch, version)));
        }

        tokio::fs::remove_dir_all(&instance_dir)
            .await
            .map_err(|e| UpdaterError::io(&instance_dir, e))?;

        let manifest_path = self.manifest_path();
        {
            let _guard = self.lock_file(&manifest_path).await;
            let mut manifest = self.read_manifest().await;
            if manifest.names.remove(&slot_key(branch, version)).is_some() {
                write_json_atomic(&manifest_path, &manifest).await?;
            }
        }

        if version == LATEST_VERSION {
            let pointer = self.latest_pointer_path(branch);
            let _guard = self.lock_file(&pointer).await;
            remove_file_if_exists(&pointer).await?;
        }

        info!("Deleted instance {}", slot_key(branch, version));
        Ok(())
    }

    /// Fresh, empty staging directory for a slot.
    pub async fn prepare_staging(
        &self,
        branch: Branch,
        version: VersionNumber,
    ) -> UpdaterResult<PathBuf> {
        let staging = self.staging_path(branch, version);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| UpdaterError::io(&staging, e))?;
        }
        create_dir_safe(&staging).await?;
        Ok(staging)
    }

    /// Swap a fully installed staging directory into place. The previous
    /// tree's `UserData` folder is carried over; the old tree is retired
    /// only after the swap succeeded.
    pub async fn promote_staging(&self, staging: &Path, target: &Path) -> UpdaterResult<()> {
        if target.exists() {
            let old_user_data = target.join(USER_DATA_DIR);
            let new_user_data = staging.join(USER_DATA_DIR);
            if old_user_data.exists() && !new_user_data.exists() {
                tokio::fs::rename(&old_user_data, &new_user_data)
                    .await
                    .map_err(|e| UpdaterError::io(&old_user_data, e))?;
            }

            let retired = retired_path(target);
            if retired.exists() {
                tokio::fs::remove_dir_all(&retired)
                    .await
                    .map_err(|e| UpdaterError::io(&retired, e))?;
            }
            tokio::fs::rename(target, &retired)
                .await
                .map_err(|e| UpdaterError::io(target, e))?;
            tokio::fs::rename(staging, target)
                .await
                .map_err(|e| UpdaterError::io(staging, e))?;
            if let Err(e) = tokio::fs::remove_dir_all(&retired).await {
                warn!("Could not remove retired tree {:?}: {}", retired, e);
            }
        } else {
            if let Some(parent) = target.parent() {
                create_dir_safe(parent).await?;
            }
            tokio::fs::rename(staging, target)
                .await
                .map_err(|e| UpdaterError::io(staging, e))?;
        }
        info!("Promoted {:?} -> {:?}", staging, target);
        Ok(())
    }

    // ── Bookkeeping helpers ─────────────────────────────

    /// Serialize access to one bookkeeping file.
    pub(crate) async fn lock_file(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .file_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn read_manifest(&self) -> InstanceManifest {
        let path = self.manifest_path();
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("Corrupt {:?}: {}", path, e);
                InstanceManifest::default()
            }),
            Err(_) => InstanceManifest::default(),
        }
    }
}

/// Last-resort guess at the latest instance's version when `latest.json`
/// is missing: the highest version embedded in a cached
/// `{branch}_{from}_{to}.pwr` (or `{branch}_{to}.pwr`) filename. Renamed or
/// cleaned cache directories defeat it; it is a hint, not a record.
pub async fn guess_version_from_cache(cache_dir: &Path, branch: Branch) -> Option<VersionNumber> {
    let mut entries = tokio::fs::read_dir(cache_dir).await.ok()?;
    let prefix = format!("{}_", branch.as_str());
    let mut best: Option<VersionNumber> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".pwr"))
        else {
            continue;
        };
        let version = stem
            .rsplit('_')
            .next()
            .and_then(|last| last.parse::<VersionNumber>().ok());
        if let Some(version) = version.filter(|v| *v > 0) {
            best = Some(best.map_or(version, |b| b.max(version)));
        }
    }
    best
}

pub(crate) fn slot_name(version: VersionNumber) -> String {
    if version == LATEST_VERSION {
        LATEST_DIR.to_string()
    } else {
        version.to_string()
    }
}

/// `latest` -> 0, `12` -> 12; anything else is not an instance slot.
pub(crate) fn parse_slot_name(name: &str) -> Option<VersionNumber> {
    if name == LATEST_DIR {
        return Some(LATEST_VERSION);
    }
    name.parse::<VersionNumber>().ok().filter(|v| *v > 0)
}

async fn has_marker(dir: &Path, marker: &Path) -> bool {
    tokio::fs::metadata(dir.join(marker))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn retired_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!("{RETIRED_PREFIX}{name}"))
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> UpdaterResult<()> {
    if let Some(parent) = path.parent() {
        create_dir_safe(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| UpdaterError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| UpdaterError::io(path, e))
}

async fn remove_file_if_exists(path: &Path) -> UpdaterResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdaterError::io(path, e)),
    }
}

pub(crate) async fn create_dir_safe(path: &Path) -> UpdaterResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| UpdaterError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(store: &InstanceStore, branch: Branch, version: VersionNumber) -> PathBuf {
        let dir = store.resolve_path(branch, version);
        let marker = dir.join(store.marker());
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(marker, b"client").unwrap();
        dir
    }

    #[test]
    fn path_resolution_is_deterministic() {
        let store = InstanceStore::new(PathBuf::from("/games"));
        assert_eq!(
            store.resolve_path(Branch::Release, 0),
            PathBuf::from("/games/release/latest")
        );
        assert_eq!(
            store.resolve_path(Branch::PreRelease, 7),
            PathBuf::from("/games/pre-release/7")
        );
        assert_eq!(
            store.staging_path(Branch::Release, 0),
            PathBuf::from("/games/release/.staging-latest")
        );
    }

    #[tokio::test]
    async fn installed_requires_marker_not_bookkeeping() {
        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());

        store.record_latest_version(Branch::Release, 5).await.unwrap();
        std::fs::create_dir_all(store.resolve_path(Branch::Release, 0)).unwrap();
        assert!(!store.is_installed(Branch::Release, 0).await);

        install(&store, Branch::Release, 0);
        assert!(store.is_installed(Branch::Release, 0).await);
        assert_eq!(
            store.read_latest_pointer(Branch::Release).await.unwrap().version,
            5
        );
    }

    #[tokio::test]
    async fn list_reports_installed_slots_with_names() {
        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());
        install(&store, Branch::Release, 0);
        install(&store, Branch::Release, 3);
        install(&store, Branch::Release, 9);
        std::fs::create_dir_all(store.resolve_path(Branch::PreRelease, 2)).unwrap();
        store
            .set_custom_name(Branch::Release, 3, Some("Old world".into()))
            .await
            .unwrap();

        let list = store.list().await.unwrap();
        let slots: Vec<_> = list.iter().map(|i| (i.branch, i.version)).collect();
        assert_eq!(
            slots,
            vec![(Branch::Release, 0), (Branch::Release, 9), (Branch::Release, 3)]
        );
        assert_eq!(list[2].custom_name.as_deref(), Some("Old world"));
    }

    #[tokio::test]
    async fn delete_leaves_siblings_alone() {
        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());
        install(&store, Branch::Release, 0);
        install(&store, Branch::Release, 4);
        store.record_latest_version(Branch::Release, 8).await.unwrap();
        store
            .set_custom_name(Branch::Release, 4, Some("Pinned".into()))
            .await
            .unwrap();

        store.delete(Branch::Release, 4).await.unwrap();

        assert!(!store.resolve_path(Branch::Release, 4).exists());
        assert!(store.is_installed(Branch::Release, 0).await);
        assert_eq!(store.read_latest_pointer(Branch::Release).await.unwrap().version, 8);
        assert!(store.get(Branch::Release, 4).await.is_none());
        assert!(matches!(
            store.delete(Branch::Release, 4).await,
            Err(UpdaterError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_latest_drops_pointer() {
        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());
        install(&store, Branch::PreRelease, 0);
        store.record_latest_version(Branch::PreRelease, 3).await.unwrap();

        store.delete(Branch::PreRelease, 0).await.unwrap();
        assert!(store.read_latest_pointer(Branch::PreRelease).await.is_none());
    }

    #[tokio::test]
    async fn promote_staging_keeps_user_data() {
        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());
        let target = install(&store, Branch::Release, 0);
        std::fs::create_dir_all(target.join(USER_DATA_DIR).join("Saves")).unwrap();
        std::fs::write(target.join(USER_DATA_DIR).join("Saves").join("world.dat"), b"w").unwrap();
        std::fs::write(target.join("obsolete.bin"), b"x").unwrap();

        let staging = store.prepare_staging(Branch::Release, 0).await.unwrap();
        std::fs::create_dir_all(staging.join("Client")).unwrap();
        std::fs::write(staging.join(store.marker()), b"new client").unwrap();

        store.promote_staging(&staging, &target).await.unwrap();

        assert!(!staging.exists());
        assert!(target.join(USER_DATA_DIR).join("Saves").join("world.dat").exists());
        assert!(!target.join("obsolete.bin").exists());
        assert_eq!(std::fs::read(target.join(store.marker())).unwrap(), b"new client");
        assert!(!retired_path(&target).exists());
    }

    #[tokio::test]
    async fn cache_heuristic_takes_highest_embedded_version() {
        let cache = tempfile::tempdir().unwrap();
        for name in [
            "release_0_4.pwr",
            "release_4_5.pwr",
            "release_7.pwr",
            "pre-release_0_12.pwr",
            "release_notes.txt",
        ] {
            std::fs::write(cache.path().join(name), b"").unwrap();
        }
        assert_eq!(
            guess_version_from_cache(cache.path(), Branch::Release).await,
            Some(7)
        );
        assert_eq!(
            guess_version_from_cache(cache.path(), Branch::PreRelease).await,
            Some(12)
        );

        let root = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(root.path().to_path_buf());
        assert_eq!(
            store.installed_latest_version(Branch::Release, cache.path()).await,
            Some(7)
        );
        store.record_latest_version(Branch::Release, 3).await.unwrap();
        assert_eq!(
            store.installed_latest_version(Branch::Release, cache.path()).await,
            Some(3)
        );
    }

    #[tokio::test]
    async fn concurrent_renames_do_not_lose_entries() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(InstanceStore::new(root.path().to_path_buf()));
        for v in 1..=8 {
            install(&store, Branch::Release, v);
        }

        let mut handles = Vec::new();
        for v in 1..=8u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_custom_name(Branch::Release, v, Some(format!("slot {v}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let list = store.list().await.unwrap();
        assert_eq!(list.iter().filter(|i| i.custom_name.is_some()).count(), 8);
    }
}
