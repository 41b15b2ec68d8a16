// ─── Patchline Core ───
// Version resolution and differential-update engine for a game client.
//
// Architecture:
//   core/
//     version/    : branch model, version probing, TTL cache
//     mirror/     : secondary artifact index (full snapshots, diff chains)
//     downloader/ : resumable, retrying, size-verified downloads
//     instance/   : on-disk instances, latest pointer, legacy migration
//     patch/      : chain planner + external patch tool
//     update/     : orchestrator state machine, runtime check, launcher
//     state/      : settings + the long-lived updater service

pub mod cancel;
pub mod downloader;
pub mod error;
pub mod events;
pub mod http;
pub mod instance;
pub mod mirror;
pub mod patch;
pub mod platform;
pub mod state;
pub mod update;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;
