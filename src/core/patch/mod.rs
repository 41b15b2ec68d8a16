pub mod applier;
pub mod planner;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::version::{Branch, VersionNumber};

pub use applier::{ButlerApplier, PatchApplier};
pub use planner::{plan, steps, PatchStep};

/// A downloadable `from -> to` artifact and where it is cached locally.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PatchArtifact {
    pub from_version: VersionNumber,
    pub to_version: VersionNumber,
    pub url: String,
    pub local_cache_path: PathBuf,
    /// Server-reported size, when the server reported one.
    pub expected_size: Option<u64>,
}

impl PatchArtifact {
    pub fn new(
        cache_dir: &Path,
        branch: Branch,
        step: PatchStep,
        url: String,
        expected_size: Option<u64>,
    ) -> Self {
        Self {
            from_version: step.from,
            to_version: step.to,
            url,
            local_cache_path: artifact_cache_path(cache_dir, branch, step.from, step.to),
            expected_size,
        }
    }
}

/// `{cache_dir}/{branch}_{from}_{to}.pwr`
pub fn artifact_cache_path(
    cache_dir: &Path,
    branch: Branch,
    from: VersionNumber,
    to: VersionNumber,
) -> PathBuf {
    cache_dir.join(format!("{}_{}_{}.pwr", branch, from, to))
}
