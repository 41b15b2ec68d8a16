use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::settings::UpdaterSettings;
use crate::core::cancel::CancellationSignal;
use crate::core::downloader::DownloadManager;
use crate::core::error::UpdaterResult;
use crate::core::events::EventSink;
use crate::core::http::{HttpTransport, ReqwestTransport};
use crate::core::instance::{InstalledInstance, InstanceStore, MigrationReport};
use crate::core::mirror::MirrorResolver;
use crate::core::patch::ButlerApplier;
use crate::core::platform::Platform;
use crate::core::update::{
    ClientRuntimeCheck, ProcessLauncher, UpdateOrchestrator, UpdateRequest, UpdateSummary,
};
use crate::core::version::{Branch, VersionCatalog, VersionNumber};

const APP_DIR_NAME: &str = "Patchline";
const BOOTSTRAP_FILE: &str = "patchline_bootstrap.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapConfig {
    data_dir: PathBuf,
}

/// Single long-lived owner of every piece of process-wide updater state:
/// the version cache and its refresh lock, the mirror-sourced branch set,
/// per-instance update locks and bookkeeping file locks. Create one and
/// pass it by reference.
pub struct UpdaterService {
    pub data_dir: PathBuf,
    pub settings: UpdaterSettings,
    pub platform: Platform,
    catalog: Arc<VersionCatalog>,
    mirror: Arc<MirrorResolver>,
    store: Arc<InstanceStore>,
    orchestrator: UpdateOrchestrator,
}

impl UpdaterService {
    /// Service rooted at `data_dir` (or the default data directory), with
    /// settings loaded from it.
    pub fn open(data_dir: Option<PathBuf>) -> UpdaterResult<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let settings = UpdaterSettings::load(&data_dir);
        let transport = Arc::new(ReqwestTransport::new()?);
        Ok(Self::with_transport(
            data_dir,
            settings,
            transport,
            Platform::current(),
        ))
    }

    pub fn with_transport(
        data_dir: PathBuf,
        settings: UpdaterSettings,
        transport: Arc<dyn HttpTransport>,
        platform: Platform,
    ) -> Self {
        let cache_dir = data_dir.join("cache");
        let instances_dir = data_dir.join("instances");

        let mirror = Arc::new(
            MirrorResolver::new(transport.clone(), settings.mirror_index_url.clone())
                .with_ttl(settings.mirror_ttl())
                .with_timeout(settings.mirror_timeout()),
        );
        let catalog = Arc::new(
            VersionCatalog::new(
                transport.clone(),
                mirror.clone(),
                settings.patch_host.clone(),
                platform.clone(),
                cache_dir.clone(),
            )
            .with_ttl(settings.version_cache_ttl())
            .with_probe_config(settings.probe_config()),
        );
        let downloads = Arc::new(
            DownloadManager::new(transport)
                .with_retry(settings.download_attempts, settings.retry_backoff())
                .with_progress_interval(settings.progress_interval()),
        );
        let store = Arc::new(
            InstanceStore::new(instances_dir).with_marker(settings.client_marker.clone()),
        );
        let orchestrator = UpdateOrchestrator::new(
            catalog.clone(),
            mirror.clone(),
            downloads,
            store.clone(),
            cache_dir,
        )
        .with_applier(Arc::new(ButlerApplier::new(settings.patch_tool.clone())))
        .with_runtime(Arc::new(ClientRuntimeCheck::new(
            settings.client_marker.clone(),
        )))
        .with_launcher(Arc::new(
            ProcessLauncher::new().with_marker(settings.client_marker.clone()),
        ));

        debug!("Updater service rooted at {:?} for {}", data_dir, platform);
        Self {
            data_dir,
            settings,
            platform,
            catalog,
            mirror,
            store,
            orchestrator,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator {
        &self.orchestrator
    }

    pub fn catalog(&self) -> &VersionCatalog {
        &self.catalog
    }

    pub fn mirror(&self) -> &MirrorResolver {
        &self.mirror
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    // ── Operations ──────────────────────────────────────

    pub async fn list_versions(&self, branch: Branch) -> UpdaterResult<Vec<VersionNumber>> {
        self.catalog.list_versions(branch).await
    }

    pub async fn update(
        &self,
        request: UpdateRequest,
        cancel: &CancellationSignal,
        events: &EventSink,
    ) -> UpdaterResult<UpdateSummary> {
        self.orchestrator.run(request, cancel, events).await
    }

    pub async fn list_instances(&self) -> UpdaterResult<Vec<InstalledInstance>> {
        self.store.list().await
    }

    pub async fn delete_instance(&self, branch: Branch, version: VersionNumber) -> UpdaterResult<()> {
        self.store.delete(branch, version).await
    }

    pub async fn rename_instance(
        &self,
        branch: Branch,
        version: VersionNumber,
        name: Option<String>,
    ) -> UpdaterResult<()> {
        self.store.set_custom_name(branch, version, name).await
    }

    pub async fn migrate_legacy(&self) -> UpdaterResult<MigrationReport> {
        self.store.migrate_legacy().await
    }

    /// Drop cached version and mirror data so the next lookup goes to the
    /// network.
    pub async fn refresh_caches(&self) -> UpdaterResult<()> {
        self.catalog.invalidate().await?;
        self.mirror.invalidate().await;
        info!("Version and mirror caches invalidated");
        Ok(())
    }

    pub fn save_settings(&self) -> UpdaterResult<()> {
        self.settings.save(&self.data_dir)
    }
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `{data_dir}/Patchline`, unless a bootstrap file in the platform data
/// directory points elsewhere.
pub fn default_data_dir() -> PathBuf {
    data_dir_from(&default_base_dir())
}

fn data_dir_from(base: &Path) -> PathBuf {
    let bootstrap_path = base.join(BOOTSTRAP_FILE);

    if let Ok(raw) = std::fs::read_to_string(&bootstrap_path) {
        if let Ok(cfg) = serde_json::from_str::<BootstrapConfig>(&raw) {
            if !cfg.data_dir.exists() {
                let _ = std::fs::create_dir_all(&cfg.data_dir);
            }
            return cfg.data_dir;
        }
    }

    let dir = base.join(APP_DIR_NAME);

    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }

    dir
}
