use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::UpdaterError;

/// Positive version number; `0` is the "resolve to newest" sentinel.
pub type VersionNumber = u32;

/// Sentinel requesting the newest version (and the rolling "latest" instance).
pub const LATEST_VERSION: VersionNumber = 0;

/// Independent update channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Branch {
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "pre-release")]
    PreRelease,
}

/// How the mirror stores a branch's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageShape {
    /// One independently installable artifact per absolute version.
    FullSnapshot,
    /// One artifact per consecutive version pair, applied in order from a base.
    DiffChain,
}

impl Branch {
    pub const ALL: [Branch; 2] = [Branch::Release, Branch::PreRelease];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Release => "release",
            Branch::PreRelease => "pre-release",
        }
    }

    /// Static per-branch storage shape.
    pub fn storage_shape(&self) -> StorageShape {
        match self {
            Branch::Release => StorageShape::FullSnapshot,
            Branch::PreRelease => StorageShape::DiffChain,
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Branch {
    type Err = UpdaterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(Branch::Release),
            "pre-release" | "prerelease" | "pre_release" => Ok(Branch::PreRelease),
            other => Err(UpdaterError::Other(format!("Unknown branch: {other}"))),
        }
    }
}
