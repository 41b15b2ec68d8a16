use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Deserialize;

use crate::core::platform::Platform;
use crate::core::version::{Branch, StorageShape, VersionNumber};

/// Raw index document: `branch -> platform -> filename -> url`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MirrorIndex {
    pub branches: HashMap<String, HashMap<String, BTreeMap<String, String>>>,
}

/// What a mirror filename describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorArtifact {
    /// `v{N}-{os}-{arch}.pwr`
    Full { version: VersionNumber },
    /// `v{from}~{to}-{os}-{arch}.pwr`
    Diff {
        from: VersionNumber,
        to: VersionNumber,
    },
}

impl MirrorIndex {
    /// filename -> url entries for one branch and platform.
    pub fn entries(&self, branch: Branch, platform: &Platform) -> Option<&BTreeMap<String, String>> {
        self.branches
            .get(branch.as_str())
            .and_then(|platforms| platforms.get(&platform.key()))
    }
}

pub fn full_artifact_name(version: VersionNumber, platform: &Platform) -> String {
    format!("v{}-{}-{}.pwr", version, platform.os, platform.arch)
}

pub fn diff_artifact_name(from: VersionNumber, to: VersionNumber, platform: &Platform) -> String {
    format!("v{}~{}-{}-{}.pwr", from, to, platform.os, platform.arch)
}

/// Decode a mirror filename for `platform`. Names for other platforms or
/// in unknown shapes yield `None`.
pub fn parse_artifact_name(name: &str, platform: &Platform) -> Option<MirrorArtifact> {
    let suffix = format!("-{}-{}.pwr", platform.os, platform.arch);
    let stem = name.strip_suffix(&suffix)?.strip_prefix('v')?;

    match stem.split_once('~') {
        Some((from, to)) => {
            let from: VersionNumber = from.parse().ok()?;
            let to: VersionNumber = to.parse().ok()?;
            (to > from).then_some(MirrorArtifact::Diff { from, to })
        }
        None => {
            let version: VersionNumber = stem.parse().ok()?;
            (version > 0).then_some(MirrorArtifact::Full { version })
        }
    }
}

/// Versions installable from a set of mirror entries, descending.
///
/// A full-snapshot branch offers every version it has a full artifact for.
/// A diff-chain branch only offers versions reachable by an unbroken chain
/// of consecutive diffs starting at 0.
pub fn available_versions<'a>(
    names: impl IntoIterator<Item = &'a String>,
    platform: &Platform,
    shape: StorageShape,
) -> Vec<VersionNumber> {
    let artifacts: Vec<MirrorArtifact> = names
        .into_iter()
        .filter_map(|name| parse_artifact_name(name, platform))
        .collect();

    let mut versions: Vec<VersionNumber> = match shape {
        StorageShape::FullSnapshot => artifacts
            .iter()
            .filter_map(|a| match a {
                MirrorArtifact::Full { version } => Some(*version),
                MirrorArtifact::Diff { .. } => None,
            })
            .collect(),
        StorageShape::DiffChain => {
            let steps: BTreeSet<VersionNumber> = artifacts
                .iter()
                .filter_map(|a| match a {
                    MirrorArtifact::Diff { from, to } if *to == from + 1 => Some(*to),
                    MirrorArtifact::Full { version: 1 } => Some(1),
                    _ => None,
                })
                .collect();
            let mut reachable = Vec::new();
            let mut next = 1;
            while steps.contains(&next) {
                reachable.push(next);
                next += 1;
            }
            reachable
        }
    };

    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions.dedup();
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux() -> Platform {
        Platform::new("linux", "amd64")
    }

    #[test]
    fn parses_full_and_diff_names() {
        let p = linux();
        assert_eq!(
            parse_artifact_name("v12-linux-amd64.pwr", &p),
            Some(MirrorArtifact::Full { version: 12 })
        );
        assert_eq!(
            parse_artifact_name("v3~4-linux-amd64.pwr", &p),
            Some(MirrorArtifact::Diff { from: 3, to: 4 })
        );
        assert_eq!(parse_artifact_name("v12-windows-amd64.pwr", &p), None);
        assert_eq!(parse_artifact_name("12-linux-amd64.pwr", &p), None);
        assert_eq!(parse_artifact_name("v4~3-linux-amd64.pwr", &p), None);
        assert_eq!(parse_artifact_name("vX-linux-amd64.pwr", &p), None);
    }

    #[test]
    fn names_round_trip_through_builders() {
        let p = linux();
        assert_eq!(
            parse_artifact_name(&diff_artifact_name(0, 1, &p), &p),
            Some(MirrorArtifact::Diff { from: 0, to: 1 })
        );
        assert_eq!(full_artifact_name(7, &p), "v7-linux-amd64.pwr");
    }

    #[test]
    fn full_snapshot_versions_descend() {
        let names: Vec<String> = ["v1-linux-amd64.pwr", "v4-linux-amd64.pwr", "v2-linux-amd64.pwr"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            available_versions(&names, &linux(), StorageShape::FullSnapshot),
            vec![4, 2, 1]
        );
    }

    #[test]
    fn diff_chain_stops_at_first_gap() {
        let names: Vec<String> = [
            "v0~1-linux-amd64.pwr",
            "v1~2-linux-amd64.pwr",
            "v2~3-linux-amd64.pwr",
            "v4~5-linux-amd64.pwr",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            available_versions(&names, &linux(), StorageShape::DiffChain),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn index_document_shape() {
        let json = r#"{
            "pre-release": {
                "linux-amd64": { "v0~1-linux-amd64.pwr": "https://m.example/a" }
            }
        }"#;
        let index: MirrorIndex = serde_json::from_str(json).unwrap();
        let entries = index.entries(Branch::PreRelease, &linux()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(index.entries(Branch::Release, &linux()).is_none());
    }
}
