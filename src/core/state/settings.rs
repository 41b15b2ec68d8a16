use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::instance::client_marker;
use crate::core::version::ProbeConfig;

pub const SETTINGS_FILE: &str = "updater_settings.json";

/// User-tunable updater settings, persisted as `updater_settings.json`.
/// Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdaterSettings {
    pub patch_host: String,
    pub mirror_index_url: String,
    pub version_cache_ttl_secs: u64,
    pub mirror_ttl_secs: u64,
    pub mirror_timeout_secs: u64,
    pub probe_concurrency: usize,
    pub probe_batch_size: u32,
    pub probe_miss_limit: u32,
    pub probe_ceiling: u32,
    pub download_attempts: u32,
    pub retry_backoff_ms: u64,
    pub progress_interval_ms: u64,
    /// External patch tool binary.
    pub patch_tool: PathBuf,
    /// Client executable, relative to an instance directory.
    pub client_marker: PathBuf,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            patch_host: "https://patches.patchline.dev".into(),
            mirror_index_url: "https://mirror.patchline.dev/index.json".into(),
            version_cache_ttl_secs: 60 * 60,
            mirror_ttl_secs: 30 * 60,
            mirror_timeout_secs: 15,
            probe_concurrency: 8,
            probe_batch_size: 20,
            probe_miss_limit: 20,
            probe_ceiling: 2000,
            download_attempts: 5,
            retry_backoff_ms: 750,
            progress_interval_ms: 100,
            patch_tool: PathBuf::from("butler"),
            client_marker: client_marker(),
        }
    }
}

impl UpdaterSettings {
    /// Settings from `data_dir`, or defaults when the file is missing or
    /// unreadable.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring corrupt {:?}: {}", path, e);
            Self::default()
        })
    }

    pub fn save(&self, data_dir: &Path) -> UpdaterResult<()> {
        std::fs::create_dir_all(data_dir).map_err(|e| UpdaterError::io(data_dir, e))?;
        let path = data_dir.join(SETTINGS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| UpdaterError::io(&path, e))
    }

    pub fn version_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.version_cache_ttl_secs)
    }

    pub fn mirror_ttl(&self) -> Duration {
        Duration::from_secs(self.mirror_ttl_secs)
    }

    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            concurrency: self.probe_concurrency.max(1),
            batch_size: self.probe_batch_size.max(1),
            miss_limit: self.probe_miss_limit.max(1),
            ceiling: self.probe_ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(UpdaterSettings::load(dir.path()), UpdaterSettings::default());

        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();
        assert_eq!(UpdaterSettings::load(dir.path()), UpdaterSettings::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{ "patch_host": "https://cdn.example", "download_attempts": 2 }"#,
        )
        .unwrap();

        let settings = UpdaterSettings::load(dir.path());
        assert_eq!(settings.patch_host, "https://cdn.example");
        assert_eq!(settings.download_attempts, 2);
        assert_eq!(settings.mirror_timeout(), Duration::from_secs(15));
        assert_eq!(settings.probe_config().batch_size, 20);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = UpdaterSettings {
            probe_concurrency: 3,
            ..UpdaterSettings::default()
        };
        settings.save(dir.path()).unwrap();
        assert_eq!(UpdaterSettings::load(dir.path()), settings);
    }
}
