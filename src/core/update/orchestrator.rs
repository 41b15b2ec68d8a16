// ─── Update Orchestrator ───
// Takes one instance from "absent or stale" to "installed and launchable":
// resolve the target, plan the gap, download each artifact (mirror as
// fallback), hand it to the patch tool, record progress durably.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use super::runtime::{ClientRuntimeCheck, GameLauncher, ProcessLauncher, RuntimeDependencies};
use super::state::{StateMachine, UpdateState};
use crate::core::cancel::CancellationSignal;
use crate::core::downloader::DownloadManager;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::{EventSink, ProgressBand, ProgressScope, ProgressStage};
use crate::core::instance::store::create_dir_safe;
use crate::core::instance::InstanceStore;
use crate::core::mirror::MirrorResolver;
use crate::core::patch::{plan, steps, ButlerApplier, PatchApplier, PatchArtifact, PatchStep};
use crate::core::version::{Branch, StorageShape, VersionCatalog, VersionNumber, LATEST_VERSION};

/// Download and patch steps share 5–85% of the bar; runtime checks take
/// the rest.
const PIPELINE_BAND: ProgressBand = ProgressBand::new(5.0, 85.0);
const RUNTIME_BAND: ProgressBand = ProgressBand::new(85.0, 100.0);
/// Share of each step's slice spent downloading; the remainder is patching.
const DOWNLOAD_SHARE: f32 = 0.75;

/// Decides, from the finished update, whether to start the client. Must not
/// block: it is collected from the user before the run starts.
pub type LaunchDecision = Arc<dyn Fn(&UpdateSummary) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct UpdateRequest {
    pub branch: Branch,
    /// `0` targets the rolling latest instance.
    pub version: VersionNumber,
    /// `None` launches unconditionally.
    pub launch_after_download: Option<LaunchDecision>,
}

impl UpdateRequest {
    pub fn latest(branch: Branch) -> Self {
        Self::pinned(branch, LATEST_VERSION)
    }

    pub fn pinned(branch: Branch, version: VersionNumber) -> Self {
        Self {
            branch,
            version,
            launch_after_download: None,
        }
    }

    pub fn with_launch_decision(
        mut self,
        decide: impl Fn(&UpdateSummary) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.launch_after_download = Some(Arc::new(decide));
        self
    }

    pub fn without_launch(self) -> Self {
        self.with_launch_decision(|_| false)
    }
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("branch", &self.branch)
            .field("version", &self.version)
            .field("launch_decision", &self.launch_after_download.is_some())
            .finish()
    }
}

/// What happened to the instance's files.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    InstalledFresh {
        version: VersionNumber,
    },
    Updated {
        from: VersionNumber,
        to: VersionNumber,
    },
    UpToDate,
    /// The update did not complete; the previous install was kept.
    UpdateFailed {
        installed: Option<VersionNumber>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpdateSummary {
    pub branch: Branch,
    pub requested_version: VersionNumber,
    /// `None` when the target could not be resolved (offline with an
    /// existing install).
    pub target_version: Option<VersionNumber>,
    /// Version now on disk, when known.
    pub installed_version: Option<VersionNumber>,
    pub outcome: UpdateOutcome,
    pub instance_path: PathBuf,
    pub launched: bool,
    pub exit_code: Option<i32>,
}

/// Result of fetching one step's artifact.
#[derive(Debug)]
pub enum StepDownload {
    Downloaded(PatchArtifact),
    /// Neither source has a single `0 -> N` artifact for a diff-chain
    /// branch; the caller must apply the mirror's chain from 0 instead.
    MirrorDiffRequired,
    Failed(UpdaterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    PrimaryFirst,
    MirrorOnly,
}

#[derive(Debug, PartialEq, Eq)]
enum ChainOutcome {
    Completed,
    MirrorDiffRequired,
}

/// Per-run values threaded through every step.
struct RunContext<'a> {
    branch: Branch,
    slot: VersionNumber,
    shape: StorageShape,
    cancel: &'a CancellationSignal,
    events: &'a EventSink,
}

pub struct UpdateOrchestrator {
    catalog: Arc<VersionCatalog>,
    mirror: Arc<MirrorResolver>,
    downloads: Arc<DownloadManager>,
    store: Arc<InstanceStore>,
    applier: Arc<dyn PatchApplier>,
    runtime: Arc<dyn RuntimeDependencies>,
    launcher: Arc<dyn GameLauncher>,
    cache_dir: PathBuf,
    /// One lock per instance directory; runs against different
    /// directories proceed independently.
    instance_locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UpdateOrchestrator {
    pub fn new(
        catalog: Arc<VersionCatalog>,
        mirror: Arc<MirrorResolver>,
        downloads: Arc<DownloadManager>,
        store: Arc<InstanceStore>,
        cache_dir: PathBuf,
    ) -> Self {
        let runtime = Arc::new(ClientRuntimeCheck::new(store.marker()));
        Self {
            catalog,
            mirror,
            downloads,
            store,
            applier: Arc::new(ButlerApplier::new("butler")),
            runtime,
            launcher: Arc::new(ProcessLauncher::new()),
            cache_dir,
            instance_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_applier(mut self, applier: Arc<dyn PatchApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeDependencies>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn GameLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Run one update sequence. State changes, progress and errors are
    /// published on `events`; cancellation leaves the instance at its last
    /// fully applied version.
    #[instrument(skip_all, fields(branch = %request.branch, version = request.version))]
    pub async fn run(
        &self,
        request: UpdateRequest,
        cancel: &CancellationSignal,
        events: &EventSink,
    ) -> UpdaterResult<UpdateSummary> {
        let events = &events.for_run();
        let mut machine = StateMachine::new(events.clone());
        match self.drive(&request, cancel, events, &mut machine).await {
            Ok(summary) => Ok(summary),
            Err(e) if e.is_cancelled() => {
                info!("Update cancelled");
                let _ = machine.advance(UpdateState::Cancelled);
                Err(e)
            }
            Err(e) => {
                error!("Update failed: {}", e);
                events.error(&e);
                let _ = machine.advance(UpdateState::Error);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: &UpdateRequest,
        cancel: &CancellationSignal,
        events: &EventSink,
        machine: &mut StateMachine,
    ) -> UpdaterResult<UpdateSummary> {
        let branch = request.branch;
        let slot = request.version;
        let run = RunContext {
            branch,
            slot,
            shape: branch.storage_shape(),
            cancel,
            events,
        };

        // ── Preparing ──
        machine.advance(UpdateState::Preparing)?;
        events.progress(ProgressStage::Preparing, 0.0, "progress.preparing", None, None);
        cancel.check()?;

        let instance_dir = self.store.resolve_path(branch, slot);
        let _guard = self.lock_instance(&instance_dir)?;
        let installed = self.store.is_installed(branch, slot).await;

        let mut offline_reason = None;
        let target = match self.resolve_target(branch, slot, installed).await {
            Ok(target) => Some(target),
            Err(e) if installed && !e.is_cancelled() => {
                warn!("Cannot resolve {} target, keeping installed files: {}", branch, e);
                events.error(&e);
                offline_reason = Some(e.to_string());
                None
            }
            Err(e) => return Err(e),
        };
        cancel.check()?;

        // ── ResolvingVersions ──
        machine.advance(UpdateState::ResolvingVersions)?;
        events.progress(
            ProgressStage::Preparing,
            PIPELINE_BAND.start,
            "progress.resolving",
            None,
            None,
        );

        let current = match (installed, slot) {
            (false, _) => None,
            (true, LATEST_VERSION) => {
                self.store
                    .installed_latest_version(branch, &self.cache_dir)
                    .await
            }
            (true, pinned) => Some(pinned),
        };
        debug!("Installed: {}, current: {:?}, target: {:?}", installed, current, target);

        let outcome = match (target, current) {
            (None, current) => {
                machine.advance(UpdateState::UpToDate)?;
                UpdateOutcome::UpdateFailed {
                    installed: current,
                    reason: offline_reason.unwrap_or_default(),
                }
            }
            (Some(target), _) if !installed => {
                machine.advance(UpdateState::InstallingFresh)?;
                // A fresh latest diff chain is built in place so every
                // recorded step can be resumed; everything else is staged.
                let staged = slot != LATEST_VERSION || run.shape == StorageShape::FullSnapshot;
                self.install_fresh(&run, target, staged).await?;
                UpdateOutcome::InstalledFresh { version: target }
            }
            // Pinned instances are never updated.
            (Some(_), _) if slot != LATEST_VERSION => {
                machine.advance(UpdateState::UpToDate)?;
                UpdateOutcome::UpToDate
            }
            (Some(target), Some(current)) if current >= target => {
                info!("{} latest is up to date at v{}", branch, current);
                machine.advance(UpdateState::UpToDate)?;
                UpdateOutcome::UpToDate
            }
            (Some(target), Some(current)) => {
                let state = match run.shape {
                    StorageShape::DiffChain => UpdateState::ApplyingDiffChain,
                    StorageShape::FullSnapshot => UpdateState::InstallingFresh,
                };
                machine.advance(state)?;
                info!("Updating {} latest v{} -> v{}", branch, current, target);
                match self.update_latest(&run, current, target).await {
                    Ok(()) => UpdateOutcome::Updated {
                        from: current,
                        to: target,
                    },
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => self.keep_previous_install(&run, e).await,
                }
            }
            (Some(target), None) => {
                // Installed but the version is unknown: reinstall through
                // staging so the current files survive a failure.
                warn!("Installed {} latest version unknown, reinstalling v{}", branch, target);
                machine.advance(UpdateState::InstallingFresh)?;
                match self.install_fresh(&run, target, true).await {
                    Ok(()) => UpdateOutcome::InstalledFresh { version: target },
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => self.keep_previous_install(&run, e).await,
                }
            }
        };
        cancel.check()?;

        // ── EnsuringRuntimeDeps ──
        machine.advance(UpdateState::EnsuringRuntimeDeps)?;
        let runtime_scope =
            ProgressScope::new(events, ProgressStage::RuntimeDeps, "progress.runtime", RUNTIME_BAND);
        self.runtime.ensure(&instance_dir, &runtime_scope, cancel).await?;

        let instance = self.store.get(branch, slot).await.ok_or_else(|| {
            UpdaterError::RuntimeNotReady(format!("{} is not installed", instance_dir.display()))
        })?;
        let installed_version = if slot == LATEST_VERSION {
            self.store.read_latest_pointer(branch).await.map(|p| p.version)
        } else {
            Some(slot)
        };

        let mut summary = UpdateSummary {
            branch,
            requested_version: slot,
            target_version: target,
            installed_version,
            outcome,
            instance_path: instance.path.clone(),
            launched: false,
            exit_code: None,
        };

        // ── Launching ──
        let launch = request
            .launch_after_download
            .as_ref()
            .map_or(true, |decide| decide(&summary));
        if launch {
            cancel.check()?;
            machine.advance(UpdateState::Launching)?;
            events.progress(ProgressStage::Launch, 100.0, "progress.launching", None, None);
            let code = self.launcher.launch(&instance).await?;
            summary.launched = true;
            summary.exit_code = Some(code);
        }

        machine.advance_with_code(UpdateState::Done, summary.exit_code)?;
        Ok(summary)
    }

    // ── Target resolution ───────────────────────────────

    async fn resolve_target(
        &self,
        branch: Branch,
        slot: VersionNumber,
        installed: bool,
    ) -> UpdaterResult<VersionNumber> {
        if slot == LATEST_VERSION {
            return self.catalog.latest_version(branch).await;
        }
        if installed {
            return Ok(slot);
        }
        let versions = self.catalog.list_versions(branch).await?;
        if versions.contains(&slot) {
            Ok(slot)
        } else {
            Err(UpdaterError::ArtifactUnavailable {
                branch,
                from: 0,
                to: slot,
            })
        }
    }

    // ── Install paths ───────────────────────────────────

    /// Install `target` from nothing, either into a staging directory that
    /// replaces the slot on success, or directly into the slot.
    async fn install_fresh(
        &self,
        run: &RunContext<'_>,
        target: VersionNumber,
        staged: bool,
    ) -> UpdaterResult<()> {
        let slot_dir = self.store.resolve_path(run.branch, run.slot);
        let record = run.slot == LATEST_VERSION;

        if !staged {
            create_dir_safe(&slot_dir).await?;
            return self.apply_plan(run, 0, target, &slot_dir, record).await;
        }

        let staging = self.store.prepare_staging(run.branch, run.slot).await?;
        if let Err(e) = self.apply_plan(run, 0, target, &staging, false).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                debug!("Could not remove staging {:?}: {}", staging, cleanup);
            }
            return Err(e);
        }
        self.store.promote_staging(&staging, &slot_dir).await?;
        if record {
            self.store.record_latest_version(run.branch, target).await?;
        }
        Ok(())
    }

    /// Bring the latest instance from `current` to `target`.
    async fn update_latest(
        &self,
        run: &RunContext<'_>,
        current: VersionNumber,
        target: VersionNumber,
    ) -> UpdaterResult<()> {
        match run.shape {
            StorageShape::FullSnapshot => self.install_fresh(run, target, true).await,
            StorageShape::DiffChain => {
                let dir = self.store.resolve_path(run.branch, LATEST_VERSION);
                self.apply_plan(run, current, target, &dir, true).await
            }
        }
    }

    /// A failed update leaves the previous install in place.
    async fn keep_previous_install(&self, run: &RunContext<'_>, e: UpdaterError) -> UpdateOutcome {
        warn!("Update of {} failed, keeping the previous install: {}", run.branch, e);
        run.events.error(&e);
        let installed = self
            .store
            .installed_latest_version(run.branch, &self.cache_dir)
            .await;
        UpdateOutcome::UpdateFailed {
            installed,
            reason: e.to_string(),
        }
    }

    /// Plan `from -> target` for the branch's shape and apply it into `dir`.
    ///
    /// A diff-chain install from 0 first asks the primary server for one
    /// combined `0 -> target` artifact; when only the mirror can serve it,
    /// the whole chain from 0 is applied instead.
    async fn apply_plan(
        &self,
        run: &RunContext<'_>,
        from: VersionNumber,
        target: VersionNumber,
        dir: &Path,
        record: bool,
    ) -> UpdaterResult<()> {
        let source = if self.catalog.is_mirror_sourced(run.branch) {
            Source::MirrorOnly
        } else {
            Source::PrimaryFirst
        };

        let first = match run.shape {
            StorageShape::DiffChain if from == 0 && source == Source::PrimaryFirst => {
                vec![PatchStep { from: 0, to: target }]
            }
            shape => steps(from, &plan(from, target, shape), shape),
        };

        match self.apply_steps(run, &first, dir, source, record).await? {
            ChainOutcome::Completed => Ok(()),
            ChainOutcome::MirrorDiffRequired => {
                info!(
                    "No combined {} 0 -> {} artifact, applying the mirror diff chain",
                    run.branch, target
                );
                let chain = steps(0, &plan(0, target, StorageShape::DiffChain), StorageShape::DiffChain);
                match self
                    .apply_steps(run, &chain, dir, Source::MirrorOnly, record)
                    .await?
                {
                    ChainOutcome::Completed => Ok(()),
                    ChainOutcome::MirrorDiffRequired => Err(UpdaterError::ArtifactUnavailable {
                        branch: run.branch,
                        from: 0,
                        to: target,
                    }),
                }
            }
        }
    }

    /// Download and apply `steps` strictly in order. With `record`, the
    /// latest pointer is advanced after every applied step.
    async fn apply_steps(
        &self,
        run: &RunContext<'_>,
        steps: &[PatchStep],
        dir: &Path,
        source: Source,
        record: bool,
    ) -> UpdaterResult<ChainOutcome> {
        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            run.cancel.check()?;
            let (download_band, patch_band) = PIPELINE_BAND.slice(index, total).split(DOWNLOAD_SHARE);

            let download_scope = ProgressScope::new(
                run.events,
                ProgressStage::Download,
                "progress.downloading",
                download_band,
            );
            let artifact = match self.download_step(run, *step, source, &download_scope).await {
                StepDownload::Downloaded(artifact) => artifact,
                StepDownload::MirrorDiffRequired => return Ok(ChainOutcome::MirrorDiffRequired),
                StepDownload::Failed(e) => return Err(e),
            };
            run.cancel.check()?;

            info!(
                "Applying {} v{} -> v{} ({}/{})",
                run.branch,
                step.from,
                step.to,
                index + 1,
                total
            );
            let patch_scope =
                ProgressScope::new(run.events, ProgressStage::Patch, "progress.patching", patch_band);
            self.applier
                .apply(&artifact.local_cache_path, dir, &patch_scope)
                .await?;

            if record {
                self.store.record_latest_version(run.branch, step.to).await?;
            }
            if let Err(e) = tokio::fs::remove_file(&artifact.local_cache_path).await {
                debug!("Could not remove {:?}: {}", artifact.local_cache_path, e);
            }
        }
        Ok(ChainOutcome::Completed)
    }

    // ── Downloads ───────────────────────────────────────

    /// Fetch one step's artifact: primary server first (unless the branch
    /// is mirror-sourced), then the mirror.
    async fn download_step(
        &self,
        run: &RunContext<'_>,
        step: PatchStep,
        source: Source,
        progress: &ProgressScope<'_>,
    ) -> StepDownload {
        if source == Source::PrimaryFirst {
            let url = self.catalog.primary_patch_url(run.branch, step.from, step.to);
            match self.fetch_artifact(run, step, url, progress).await {
                Ok(artifact) => return StepDownload::Downloaded(artifact),
                Err(e) if e.is_cancelled() => return StepDownload::Failed(e),
                Err(e) => warn!(
                    "Primary download of {} v{} -> v{} failed, trying mirror: {}",
                    run.branch, step.from, step.to, e
                ),
            }
        }

        let platform = self.catalog.platform();
        let url = match run.shape {
            StorageShape::FullSnapshot => {
                self.mirror.get_full_url(platform, run.branch, step.to).await
            }
            StorageShape::DiffChain if step.from == 0 && step.to > 1 => {
                return StepDownload::MirrorDiffRequired;
            }
            StorageShape::DiffChain => {
                self.mirror
                    .get_diff_url(platform, run.branch, step.from, step.to)
                    .await
            }
        };
        let Some(url) = url else {
            return StepDownload::Failed(UpdaterError::ArtifactUnavailable {
                branch: run.branch,
                from: step.from,
                to: step.to,
            });
        };

        match self.fetch_artifact(run, step, url, progress).await {
            Ok(artifact) => StepDownload::Downloaded(artifact),
            Err(e) => StepDownload::Failed(e),
        }
    }

    async fn fetch_artifact(
        &self,
        run: &RunContext<'_>,
        step: PatchStep,
        url: String,
        progress: &ProgressScope<'_>,
    ) -> UpdaterResult<PatchArtifact> {
        let expected_size = self.downloads.get_remote_size(&url).await;
        let artifact = PatchArtifact::new(&self.cache_dir, run.branch, step, url, expected_size);
        self.downloads
            .fetch_cached(
                &artifact.url,
                &artifact.local_cache_path,
                artifact.expected_size,
                progress,
                run.cancel,
            )
            .await?;
        Ok(artifact)
    }

    // ── Locks ───────────────────────────────────────────

    fn lock_instance(&self, dir: &Path) -> UpdaterResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .instance_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned()
            .map_err(|_| UpdaterError::InstanceBusy(dir.to_path_buf()))
    }
}
