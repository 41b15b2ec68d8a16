// ─── Patch Applier ───
// The byte-level patch format is owned by an external tool; this module
// only spawns it and translates its JSON progress lines.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::ProgressScope;

/// Applies one downloaded artifact onto an instance directory.
///
/// Implementations must leave `target_dir` untouched when they fail before
/// writing, and must not be run concurrently against the same directory.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(
        &self,
        artifact: &Path,
        target_dir: &Path,
        progress: &ProgressScope<'_>,
    ) -> UpdaterResult<()>;
}

/// Default applier: `{binary} apply --json --staging-dir <tmp> <artifact> <target>`.
pub struct ButlerApplier {
    binary: PathBuf,
}

impl ButlerApplier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// One line of the tool's `--json` output.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ToolMessage {
    Progress {
        #[serde(default)]
        progress: f64,
    },
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

fn parse_tool_line(line: &str) -> Option<ToolMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[async_trait]
impl PatchApplier for ButlerApplier {
    async fn apply(
        &self,
        artifact: &Path,
        target_dir: &Path,
        progress: &ProgressScope<'_>,
    ) -> UpdaterResult<()> {
        if !artifact.exists() {
            return Err(UpdaterError::PatchApplication(format!(
                "artifact not found: {}",
                artifact.display()
            )));
        }
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| UpdaterError::io(target_dir, e))?;

        let staging = std::env::temp_dir().join(format!("patchline-staging-{}", uuid::Uuid::new_v4()));

        let mut cmd = Command::new(&self.binary);
        cmd.arg("apply")
            .arg("--json")
            .arg("--staging-dir")
            .arg(&staging)
            .arg(artifact)
            .arg(target_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Applying {:?} to {:?}", artifact, target_dir);
        debug!("Command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            UpdaterError::PatchApplication(format!(
                "could not start {}: {e}",
                self.binary.display()
            ))
        })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[patch tool] {}", line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let mut last_error: Option<String> = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| UpdaterError::PatchApplication(e.to_string()))?
            {
                match parse_tool_line(&line) {
                    Some(ToolMessage::Progress { progress: fraction }) => {
                        progress.report(fraction.clamp(0.0, 1.0) as f32, None, None);
                    }
                    Some(ToolMessage::Log { level, message }) => {
                        debug!("[patch tool:{}] {}", level, message);
                    }
                    Some(ToolMessage::Error { message }) => {
                        warn!("[patch tool] {}", message);
                        last_error = Some(message);
                    }
                    Some(ToolMessage::Other) | None => {
                        debug!("[patch tool] {}", line);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| UpdaterError::PatchApplication(e.to_string()))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if tokio::fs::metadata(&staging).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!("Could not remove patch staging dir {:?}: {}", staging, e);
            }
        }

        if !status.success() {
            let detail = last_error
                .or_else(|| stderr.lines().last().map(str::to_string))
                .unwrap_or_default();
            return Err(UpdaterError::PatchApplication(format!(
                "{} exited with {status}: {detail}",
                self.binary.display()
            )));
        }

        progress.report(1.0, None, None);
        Ok(())
    }
}
