use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::core::version::Branch;

/// Central error type for the updater core.
/// Every module returns `Result<T, UpdaterError>`.
#[derive(Debug, Error)]
pub enum UpdaterError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("No artifact available for {branch} {from} -> {to}")]
    ArtifactUnavailable { branch: Branch, from: u32, to: u32 },

    #[error("Mirror index unavailable: {0}")]
    MirrorUnavailable(String),

    #[error("No versions available for branch {0}")]
    NoVersionsAvailable(Branch),

    // ── Integrity ───────────────────────────────────────
    #[error("Size mismatch for {path:?}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    // ── Patching ────────────────────────────────────────
    #[error("Patch application failed: {0}")]
    PatchApplication(String),

    // ── Cache ───────────────────────────────────────────
    #[error("Version cache invalid: {0}")]
    CacheInvalid(String),

    // ── JSON ────────────────────────────────────────────
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Instance ────────────────────────────────────────
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("An update is already running for {0:?}")]
    InstanceBusy(PathBuf),

    // ── Runtime / launch ────────────────────────────────
    #[error("Runtime dependencies not ready: {0}")]
    RuntimeNotReady(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    // ── Control flow ────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    // ── Generic ─────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type UpdaterResult<T> = Result<T, UpdaterError>;

/// Coarse classification surfaced to the UI in `error` events.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Integrity,
    PatchApplication,
    CacheInvalid,
    Cancelled,
    Fatal,
}

impl UpdaterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdaterError::Http(_)
            | UpdaterError::DownloadFailed { .. }
            | UpdaterError::ArtifactUnavailable { .. }
            | UpdaterError::MirrorUnavailable(_)
            | UpdaterError::NoVersionsAvailable(_) => ErrorKind::Network,
            UpdaterError::SizeMismatch { .. } => ErrorKind::Integrity,
            UpdaterError::PatchApplication(_) => ErrorKind::PatchApplication,
            UpdaterError::CacheInvalid(_) => ErrorKind::CacheInvalid,
            UpdaterError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdaterError::Cancelled)
    }

    /// Whether another attempt at the same request can succeed. Client
    /// errors other than timeouts and throttling are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpdaterError::Cancelled | UpdaterError::ArtifactUnavailable { .. } => false,
            UpdaterError::DownloadFailed { status, .. } => {
                !(400..500).contains(status) || matches!(status, 408 | 416 | 429)
            }
            _ => true,
        }
    }

    /// Wrap an IO error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdaterError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<std::io::Error> for UpdaterError {
    fn from(source: std::io::Error) -> Self {
        UpdaterError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

// ── Serialization for the UI boundary ───────────────────
impl Serialize for UpdaterError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
