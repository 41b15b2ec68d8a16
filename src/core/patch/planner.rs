// ─── Patch Chain Planner ───
// Ordered versions to apply to go from the installed version to a target.

use crate::core::version::{StorageShape, VersionNumber};

/// One `from -> to` artifact application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchStep {
    pub from: VersionNumber,
    pub to: VersionNumber,
}

/// Versions to apply, in order.
///
/// - Full snapshot: `[target]`, whatever is installed; the artifact is a
///   complete image built from nothing.
/// - Diff chain: `[installed + 1, ..., target]`; empty when already there.
///
/// Applying the plan in order and recording each finished step makes it
/// resumable: `plan(recorded, target, shape)` yields exactly the rest.
pub fn plan(
    installed: VersionNumber,
    target: VersionNumber,
    shape: StorageShape,
) -> Vec<VersionNumber> {
    if target == 0 {
        return Vec::new();
    }
    match shape {
        StorageShape::FullSnapshot => vec![target],
        StorageShape::DiffChain if installed >= target => Vec::new(),
        StorageShape::DiffChain => (installed + 1..=target).collect(),
    }
}

/// Pair a plan with the version each step starts from.
pub fn steps(
    installed: VersionNumber,
    plan: &[VersionNumber],
    shape: StorageShape,
) -> Vec<PatchStep> {
    match shape {
        StorageShape::FullSnapshot => plan.iter().map(|&to| PatchStep { from: 0, to }).collect(),
        StorageShape::DiffChain => {
            let mut from = installed;
            plan.iter()
                .map(|&to| {
                    let step = PatchStep { from, to };
                    from = to;
                    step
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_chain_fills_the_gap() {
        assert_eq!(plan(3, 7, StorageShape::DiffChain), vec![4, 5, 6, 7]);
        assert_eq!(plan(0, 1, StorageShape::DiffChain), vec![1]);
        assert_eq!(plan(0, 3, StorageShape::DiffChain), vec![1, 2, 3]);
    }

    #[test]
    fn diff_chain_up_to_date_is_empty() {
        assert!(plan(7, 7, StorageShape::DiffChain).is_empty());
        assert!(plan(9, 7, StorageShape::DiffChain).is_empty());
    }

    #[test]
    fn full_snapshot_is_always_the_target() {
        for installed in [0, 1, 6, 7, 12] {
            assert_eq!(plan(installed, 7, StorageShape::FullSnapshot), vec![7]);
        }
    }

    #[test]
    fn sentinel_target_plans_nothing() {
        assert!(plan(3, 0, StorageShape::DiffChain).is_empty());
        assert!(plan(3, 0, StorageShape::FullSnapshot).is_empty());
    }

    #[test]
    fn resuming_from_recorded_step_yields_the_rest() {
        let full = plan(3, 7, StorageShape::DiffChain);
        // Steps 4 and 5 applied, then stopped.
        let recorded = full[1];
        assert_eq!(plan(recorded, 7, StorageShape::DiffChain), vec![6, 7]);
    }

    #[test]
    fn steps_chain_consecutive_pairs() {
        let diff = plan(3, 6, StorageShape::DiffChain);
        assert_eq!(
            steps(3, &diff, StorageShape::DiffChain),
            vec![
                PatchStep { from: 3, to: 4 },
                PatchStep { from: 4, to: 5 },
                PatchStep { from: 5, to: 6 },
            ]
        );
        let full = plan(3, 6, StorageShape::FullSnapshot);
        assert_eq!(
            steps(3, &full, StorageShape::FullSnapshot),
            vec![PatchStep { from: 0, to: 6 }]
        );
    }
}
