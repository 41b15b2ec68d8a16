// ─── Legacy Layout Migration ───
// Older launchers kept instances in dash-suffixed folders directly under the
// root (`release-5`, `pre-release-v3`, `release-latest`) or in v-prefixed
// version folders (`release/v5`). Folding them into `{root}/{branch}/{slot}`
// is idempotent and never deletes anything that is not an empty directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use super::store::{parse_slot_name, slot_name, InstanceStore};
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::version::{Branch, VersionNumber, LATEST_VERSION};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy folders renamed into an empty slot.
    pub moved: Vec<PathBuf>,
    /// Legacy folders merged into an existing slot and removed.
    pub merged: Vec<PathBuf>,
    /// Legacy folders left in place because of conflicting files.
    pub conflicted: Vec<PathBuf>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.merged.is_empty() && self.conflicted.is_empty()
    }
}

impl InstanceStore {
    pub async fn migrate_legacy(&self) -> UpdaterResult<MigrationReport> {
        let root = self.root().to_path_buf();

        let report = tokio::task::spawn_blocking(move || migrate_blocking(&root))
            .await
            .map_err(|e| UpdaterError::Other(format!("Task join error: {e}")))??;

        if !report.is_empty() {
            info!(
                "Legacy migration: {} moved, {} merged, {} conflicted",
                report.moved.len(),
                report.merged.len(),
                report.conflicted.len()
            );
        }
        Ok(report)
    }
}

/// Branch and slot encoded in a legacy root-level folder name.
pub fn parse_legacy_name(name: &str) -> Option<(Branch, VersionNumber)> {
    // Longest prefixes first: "pre-release-" also ends in "release-".
    const PREFIXES: [(&str, Branch); 3] = [
        ("pre-release-", Branch::PreRelease),
        ("prerelease-", Branch::PreRelease),
        ("release-", Branch::Release),
    ];

    let lower = name.to_ascii_lowercase();
    let (rest, branch) = PREFIXES
        .iter()
        .find_map(|(prefix, branch)| lower.strip_prefix(prefix).map(|rest| (rest, *branch)))?;
    Some((branch, parse_legacy_slot(rest)?))
}

/// `latest`, `12` or `v12`.
fn parse_legacy_slot(raw: &str) -> Option<VersionNumber> {
    if raw == "latest" {
        return Some(LATEST_VERSION);
    }
    let digits = raw.strip_prefix('v').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<VersionNumber>().ok().filter(|v| *v > 0)
}

fn migrate_blocking(root: &Path) -> UpdaterResult<MigrationReport> {
    let mut report = MigrationReport::default();
    if !root.exists() {
        return Ok(report);
    }

    let mut candidates: Vec<(PathBuf, PathBuf)> = Vec::new();

    // Dash-suffixed folders at the root.
    for entry in fs::read_dir(root).map_err(|e| UpdaterError::io(root, e))? {
        let entry = entry.map_err(|e| UpdaterError::io(root, e))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((branch, version)) = parse_legacy_name(&name) {
            let target = root.join(branch.as_str()).join(slot_name(version));
            candidates.push((entry.path(), target));
        }
    }

    // v-prefixed slots inside branch folders.
    for branch in Branch::ALL {
        let branch_dir = root.join(branch.as_str());
        let Ok(entries) = fs::read_dir(&branch_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_slot_name(&name).is_some() || !name.starts_with('v') {
                continue;
            }
            if let Some(version) = parse_legacy_slot(&name).filter(|v| *v > 0) {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    candidates.push((entry.path(), branch_dir.join(slot_name(version))));
                }
            }
        }
    }

    candidates.sort();
    for (legacy, target) in candidates {
        if !target.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| UpdaterError::io(parent, e))?;
            }
            fs::rename(&legacy, &target).map_err(|e| UpdaterError::io(&legacy, e))?;
            info!("Migrated {:?} -> {:?}", legacy, target);
            report.moved.push(legacy);
            continue;
        }

        merge_tree(&legacy, &target)?;
        remove_empty_dirs(&legacy)?;
        if legacy.exists() {
            warn!(
                "Legacy folder {:?} conflicts with {:?}; left in place",
                legacy, target
            );
            report.conflicted.push(legacy);
        } else {
            info!("Merged {:?} into {:?}", legacy, target);
            report.merged.push(legacy);
        }
    }

    Ok(report)
}

/// Move every entry of `source` that `target` lacks; recurse into
/// directories both sides have. Conflicting files stay in `source`.
fn merge_tree(source: &Path, target: &Path) -> UpdaterResult<()> {
    for entry in fs::read_dir(source).map_err(|e| UpdaterError::io(source, e))? {
        let entry = entry.map_err(|e| UpdaterError::io(source, e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());

        if !to.exists() {
            fs::rename(&from, &to).map_err(|e| UpdaterError::io(&from, e))?;
        } else if from.is_dir() && to.is_dir() {
            merge_tree(&from, &to)?;
        }
    }
    Ok(())
}

/// Remove `dir` bottom-up if (and only if) it contains nothing but empty
/// directories.
fn remove_empty_dirs(dir: &Path) -> UpdaterResult<bool> {
    let mut empty = true;
    for entry in fs::read_dir(dir).map_err(|e| UpdaterError::io(dir, e))? {
        let entry = entry.map_err(|e| UpdaterError::io(dir, e))?;
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            if !remove_empty_dirs(&path)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    if empty {
        fs::remove_dir(dir).map_err(|e| UpdaterError::io(dir, e))?;
    }
    Ok(empty)
}
