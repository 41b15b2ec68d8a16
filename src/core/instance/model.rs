use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::version::{Branch, VersionNumber, LATEST_VERSION};

/// Directory name of the rolling "latest" instance.
pub const LATEST_DIR: &str = "latest";

/// Folder inside an instance that holds player data; never deleted by
/// migration or staged installs.
pub const USER_DATA_DIR: &str = "UserData";

/// Client executable whose presence means "installed", relative to the
/// instance directory.
pub fn client_marker() -> PathBuf {
    let exe = if cfg!(target_os = "windows") {
        "GameClient.exe"
    } else {
        "GameClient"
    };
    Path::new("Client").join(exe)
}

/// One locally installed copy of the client.
///
/// Each instance lives at `{root}/{branch}/{version|latest}/`:
/// - `Client/`: game files written by the patch tool
/// - `UserData/`: player data kept across reinstalls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledInstance {
    pub branch: Branch,
    /// `0` for the rolling latest instance.
    pub version: VersionNumber,
    pub path: PathBuf,
    pub custom_name: Option<String>,
    pub is_latest: bool,
}

impl InstalledInstance {
    pub fn new(branch: Branch, version: VersionNumber, path: PathBuf) -> Self {
        Self {
            branch,
            version,
            path,
            custom_name: None,
            is_latest: version == LATEST_VERSION,
        }
    }

    pub fn user_data_dir(&self) -> PathBuf {
        self.path.join(USER_DATA_DIR)
    }

    pub fn display_name(&self) -> String {
        match &self.custom_name {
            Some(name) => name.clone(),
            None if self.is_latest => format!("{} (latest)", self.branch),
            None => format!("{} v{}", self.branch, self.version),
        }
    }
}

/// `{root}/{branch}/latest.json`: which version the latest instance holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatestPointer {
    pub branch: Branch,
    pub version: VersionNumber,
    pub updated_at: DateTime<Utc>,
}

/// Slot key used in `instances.json`, e.g. `release/latest`, `release/7`.
pub fn slot_key(branch: Branch, version: VersionNumber) -> String {
    if version == LATEST_VERSION {
        format!("{}/{}", branch, LATEST_DIR)
    } else {
        format!("{}/{}", branch, version)
    }
}
