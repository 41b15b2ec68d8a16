// ─── Runtime Dependencies & Launch ───
// Collaborators the orchestrator calls after the install step. Both are
// traits so tests and embedders can substitute their own.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::cancel::CancellationSignal;
use crate::core::error::{UpdaterError, UpdaterResult};
use crate::core::events::ProgressScope;
use crate::core::instance::{client_marker, InstalledInstance};

/// Makes sure an instance can start. Must be idempotent: it runs before
/// every launch attempt, whatever the update did.
#[async_trait]
pub trait RuntimeDependencies: Send + Sync {
    async fn ensure(
        &self,
        instance_dir: &Path,
        progress: &ProgressScope<'_>,
        cancel: &CancellationSignal,
    ) -> UpdaterResult<()>;
}

/// Starts the client and waits for it to exit.
#[async_trait]
pub trait GameLauncher: Send + Sync {
    async fn launch(&self, instance: &InstalledInstance) -> UpdaterResult<i32>;
}

/// Default readiness check: the client executable exists and, on unix,
/// carries the executable bit.
pub struct ClientRuntimeCheck {
    marker: PathBuf,
}

impl ClientRuntimeCheck {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl RuntimeDependencies for ClientRuntimeCheck {
    async fn ensure(
        &self,
        instance_dir: &Path,
        progress: &ProgressScope<'_>,
        cancel: &CancellationSignal,
    ) -> UpdaterResult<()> {
        cancel.check()?;
        progress.report(0.0, None, None);

        let client = instance_dir.join(&self.marker);
        let meta = tokio::fs::metadata(&client).await.map_err(|_| {
            UpdaterError::RuntimeNotReady(format!("client missing at {}", client.display()))
        })?;
        if !meta.is_file() {
            return Err(UpdaterError::RuntimeNotReady(format!(
                "{} is not a file",
                client.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut perms = meta.permissions();
            if perms.mode() & 0o111 != 0o111 {
                perms.set_mode(perms.mode() | 0o755);
                tokio::fs::set_permissions(&client, perms)
                    .await
                    .map_err(|e| UpdaterError::io(&client, e))?;
                debug!("Marked {:?} executable", client);
            }
        }

        progress.report(1.0, None, None);
        Ok(())
    }
}

/// Default launcher: runs the client executable from its own directory.
#[derive(Debug)]
pub struct ProcessLauncher {
    /// Client executable relative to the instance directory.
    marker: PathBuf,
    extra_args: Vec<String>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            marker: client_marker(),
            extra_args: Vec::new(),
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

#[async_trait]
impl GameLauncher for ProcessLauncher {
    async fn launch(&self, instance: &InstalledInstance) -> UpdaterResult<i32> {
        let client = instance.path.join(&self.marker);
        let workdir = client
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| instance.path.clone());

        let mut cmd = Command::new(&client);
        cmd.arg("--user-dir")
            .arg(instance.user_data_dir())
            .args(&self.extra_args)
            .current_dir(&workdir)
            .stdin(Stdio::null());

        info!("Launching {} from {:?}", instance.display_name(), client);
        debug!("Command: {:?}", cmd);

        let status = cmd
            .status()
            .await
            .map_err(|e| UpdaterError::Launch(format!("{}: {e}", client.display())))?;
        let code = status.code().unwrap_or(-1);
        info!("{} exited with code {}", instance.display_name(), code);
        Ok(code)
    }
}
