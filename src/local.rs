//! Local volume variant.
//!
//! Prepares a directory on the host with the agent configuration and the
//! context repos, and runs the documentation server against it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::repos::Registry;
use crate::sync::{report, sync_repos, GitBackend, LocalGit, SyncOptions, SyncResult};
use crate::template::{BundlePaths, ConfigBundle, TemplateParams, CONFIG_FILE};

/// Checkout directory under the volume root.
pub const CONTEXT_REPOS_DIR: &str = "context-repos";

/// A host directory holding configuration and repos.
#[derive(Debug, Clone)]
pub struct LocalVolume {
    root: PathBuf,
    registry: Registry,
}

impl LocalVolume {
    pub fn new(root: impl Into<PathBuf>, registry: Registry) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join(CONTEXT_REPOS_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn template_params(&self) -> TemplateParams {
        TemplateParams::volume(self.repos_dir(), self.registry.names())
    }

    fn check_root(&self) -> Result<()> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(Error::InvalidPath(self.root.clone()));
        }
        Ok(())
    }

    /// Writes `opencode.json` and the prompts, replacing earlier ones.
    pub async fn write_config(&self) -> Result<BundlePaths> {
        self.check_root()?;
        tracing::info!(volume = ?self.root, "setting up config and agent prompts");

        let bundle = ConfigBundle::render(&self.template_params())?;
        let paths = bundle.write_to_dir(&self.root).await?;

        tracing::info!(path = ?paths.config, "config written");
        tracing::info!(path = ?paths.docs_prompt, "docs agent prompt written");
        tracing::info!(path = ?paths.ask_prompt, "ask agent prompt written");
        Ok(paths)
    }

    /// Clones or pulls every registry repo under [`repos_dir`](Self::repos_dir).
    pub async fn sync(
        &self,
        backend: Arc<dyn GitBackend>,
        options: &SyncOptions,
    ) -> Result<Vec<SyncResult>> {
        self.check_root()?;
        tracing::info!(volume = ?self.root, "loading context");
        sync_repos(backend, self.registry.repos(), &self.repos_dir(), options).await
    }

    /// Config plus repo sync with the host's git. Returns how many repos
    /// are usable.
    pub async fn prepare(&self) -> Result<usize> {
        self.write_config().await?;
        let results = self.sync(Arc::new(LocalGit::new()), &SyncOptions::default()).await?;
        let loaded = report(&results).len();
        tracing::info!(loaded, total = results.len(), "loaded context items");
        Ok(loaded)
    }
}

/// The documentation server as a local child process.
#[derive(Debug, Clone)]
pub struct LocalServer {
    program: String,
    port: u16,
}

impl LocalServer {
    pub fn new(program: impl Into<String>, port: u16) -> Self {
        Self {
            program: program.into(),
            port,
        }
    }

    fn command(&self, volume: &LocalVolume) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("serve")
            .arg(format!("--port={}", self.port))
            .env("OPENCODE_CONFIG", volume.config_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    /// Runs the server, logging its stdout, until it exits or `shutdown`
    /// resolves. Returns `None` when stopped by `shutdown`.
    pub async fn run_until_shutdown<F>(
        &self,
        volume: &LocalVolume,
        shutdown: F,
    ) -> Result<Option<ExitStatus>>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tracing::info!(program = %self.program, port = self.port, volume = ?volume.root(), "spawning server");
        let mut child = self.command(volume).spawn().map_err(|e| Error::Process {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Process {
            program: self.program.clone(),
            reason: "stdout not captured".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => tracing::info!(target: "opencode", "{}", line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading server output");
                        stdout_open = false;
                    }
                },
                status = child.wait() => {
                    let status = status.map_err(|e| Error::Process {
                        program: self.program.clone(),
                        reason: e.to_string(),
                    })?;
                    tracing::info!(%status, "server exited");
                    return Ok(Some(status));
                }
                _ = &mut shutdown => {
                    tracing::info!("cleaning up");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill server");
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_config_lists_volume_repos() {
        let dir = TempDir::new().unwrap();
        let volume = LocalVolume::new(dir.path(), Registry::local_context());

        let paths = volume.write_config().await.unwrap();

        let prompt = std::fs::read_to_string(paths.docs_prompt).unwrap();
        let effect = dir.path().join("context-repos").join("effect");
        assert_eq!(prompt.matches(&*effect.to_string_lossy()).count(), 1);
        assert!(prompt.contains("- svelte: "));
    }

    #[tokio::test]
    async fn file_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("vol");
        std::fs::write(&file, "").unwrap();

        let err = LocalVolume::new(&file, Registry::local_context())
            .write_config()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath(p) if p == file));
    }

    #[tokio::test]
    async fn missing_program_is_process_error() {
        let dir = TempDir::new().unwrap();
        let volume = LocalVolume::new(dir.path(), Registry::local_context());
        let server = LocalServer::new("/nonexistent/opencode", 8080);

        let err = server
            .run_until_shutdown(&volume, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
    }

    #[cfg(unix)]
    fn fake_server(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-opencode");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_exit_status_is_returned() {
        let dir = TempDir::new().unwrap();
        let volume = LocalVolume::new(dir.path(), Registry::local_context());
        let program = fake_server(dir.path(), "echo \"config $OPENCODE_CONFIG $1 $2\"\nexit 3");

        let status = LocalServer::new(program, 8080)
            .run_until_shutdown(&volume, std::future::pending())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_server() {
        let dir = TempDir::new().unwrap();
        let volume = LocalVolume::new(dir.path(), Registry::local_context());
        let program = fake_server(dir.path(), "echo started\nexec sleep 30");

        let stopped = LocalServer::new(program, 8080)
            .run_until_shutdown(&volume, tokio::time::sleep(std::time::Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(stopped.is_none());
    }
}
