//! Clone-or-pull synchronization of documentation repositories.
//!
//! Every descriptor is synced independently: a repo whose checkout is
//! missing is shallow-cloned, one that exists is pulled. Up to
//! [`DEFAULT_CONCURRENCY`] syncs run at once and a failing repo never
//! cancels its siblings. Existing checkouts are pulled as-is, without
//! switching to the descriptor's branch.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::repos::RepoDescriptor;
use crate::sandbox::SandboxApi;

/// Maximum number of repositories synced at the same time.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// What a successful sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Pulled,
}

/// Outcome of syncing one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { path: PathBuf, action: SyncAction },
    Failed { error: String },
}

/// Result of syncing one [`RepoDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub name: String,
    pub outcome: SyncOutcome,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Synced { .. })
    }

    /// Checkout path, when the sync succeeded.
    pub fn path(&self) -> Option<&Path> {
        match &self.outcome {
            SyncOutcome::Synced { path, .. } => Some(path),
            SyncOutcome::Failed { .. } => None,
        }
    }

    /// Error message, when the sync failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            SyncOutcome::Synced { .. } => None,
            SyncOutcome::Failed { error } => Some(error),
        }
    }
}

/// Options for a sync batch.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Ceiling on concurrent syncs. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Log a warning when an existing checkout is on a different branch
    /// than its descriptor. The checkout is still only pulled.
    pub check_branch: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            check_branch: false,
        }
    }
}

/// Arguments for a shallow single-branch clone of `repo` into `target`.
pub fn clone_args(repo: &RepoDescriptor, target: &Path) -> Vec<String> {
    vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--single-branch".to_string(),
        "--branch".to_string(),
        repo.branch().to_string(),
        repo.url.clone(),
        target.to_string_lossy().into_owned(),
    ]
}

/// Joins `args` into a `sh` command line, single-quoting any argument
/// that is not made only of safe characters.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Where git runs: the local host or a remote sandbox.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Ensures the base directory for checkouts exists.
    async fn prepare(&self, base_dir: &Path) -> Result<()>;

    /// Returns true if `path` exists and is a directory.
    async fn is_dir(&self, path: &Path) -> Result<bool>;

    /// Runs `git clone` with the given arguments.
    async fn clone_repo(&self, args: &[String]) -> Result<()>;

    /// Runs `git pull` inside `repo_path`.
    async fn pull(&self, repo_path: &Path) -> Result<()>;

    /// Returns the checked-out branch of `repo_path`.
    async fn current_branch(&self, repo_path: &Path) -> Result<String>;
}

async fn sync_one(
    backend: &dyn GitBackend,
    repo: &RepoDescriptor,
    base_dir: &Path,
    check_branch: bool,
) -> Result<SyncOutcome> {
    let target = base_dir.join(&repo.name);

    let exists = match backend.is_dir(&target).await {
        Ok(exists) => exists,
        Err(e) => {
            tracing::debug!(repo = %repo.name, error = %e, "existence check failed, assuming absent");
            false
        }
    };

    if exists {
        if check_branch {
            match backend.current_branch(&target).await {
                Ok(branch) if branch != repo.branch() => tracing::warn!(
                    repo = %repo.name,
                    checked_out = %branch,
                    expected = %repo.branch(),
                    "existing checkout is on a different branch, pulling anyway"
                ),
                Ok(_) => {}
                Err(e) => tracing::debug!(repo = %repo.name, error = %e, "could not read branch"),
            }
        }
        tracing::info!(repo = %repo.name, path = ?target, "pulling repo");
        backend.pull(&target).await?;
        Ok(SyncOutcome::Synced {
            path: target,
            action: SyncAction::Pulled,
        })
    } else {
        tracing::info!(repo = %repo.name, branch = %repo.branch(), "cloning repo");
        backend.clone_repo(&clone_args(repo, &target)).await?;
        Ok(SyncOutcome::Synced {
            path: target,
            action: SyncAction::Cloned,
        })
    }
}

/// Syncs every repo into `base_dir/<name>`.
///
/// Returns exactly one result per descriptor, in input order. Individual
/// failures are reported in the results; only a failure to prepare
/// `base_dir` is returned as an error.
pub async fn sync_repos(
    backend: Arc<dyn GitBackend>,
    repos: &[RepoDescriptor],
    base_dir: &Path,
    options: &SyncOptions,
) -> Result<Vec<SyncResult>> {
    backend.prepare(base_dir).await?;

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    tracing::info!(
        count = repos.len(),
        concurrency = options.concurrency.max(1),
        base_dir = ?base_dir,
        "syncing repos"
    );

    for (idx, repo) in repos.iter().cloned().enumerate() {
        let backend = Arc::clone(&backend);
        let semaphore = Arc::clone(&semaphore);
        let base_dir = base_dir.to_path_buf();
        let check_branch = options.check_branch;

        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => match sync_one(backend.as_ref(), &repo, &base_dir, check_branch).await {
                    Ok(outcome) => outcome,
                    Err(e) => SyncOutcome::Failed {
                        error: e.to_string(),
                    },
                },
                Err(e) => SyncOutcome::Failed {
                    error: format!("sync slot unavailable: {e}"),
                },
            };
            (
                idx,
                SyncResult {
                    name: repo.name,
                    outcome,
                },
            )
        });
    }

    let mut slots: Vec<Option<SyncResult>> = vec![None; repos.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => tracing::error!(error = %e, "repo sync task panicked"),
        }
    }

    let results = slots
        .into_iter()
        .zip(repos)
        .map(|(slot, repo)| {
            slot.unwrap_or_else(|| SyncResult {
                name: repo.name.clone(),
                outcome: SyncOutcome::Failed {
                    error: "sync task aborted".to_string(),
                },
            })
        })
        .collect();

    Ok(results)
}

/// Logs each result and returns the successful ones.
pub fn report(results: &[SyncResult]) -> Vec<&SyncResult> {
    let mut synced = Vec::new();
    for result in results {
        match &result.outcome {
            SyncOutcome::Synced { path, action } => {
                tracing::info!(repo = %result.name, ?action, path = ?path, "synced repo");
                synced.push(result);
            }
            SyncOutcome::Failed { error } => {
                tracing::error!(repo = %result.name, %error, "repo failed to sync");
            }
        }
    }
    synced
}

/// Runs git on the local host.
#[derive(Debug, Clone)]
pub struct LocalGit {
    program: String,
}

impl Default for LocalGit {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGit {
    /// Uses `git` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Uses a specific git executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd.output().await.map_err(|e| Error::Process {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        for line in stdout.lines() {
            tracing::debug!(cwd = ?cwd, "git: {}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl GitBackend for LocalGit {
    async fn prepare(&self, base_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(base_dir).await?;
        Ok(())
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clone_repo(&self, args: &[String]) -> Result<()> {
        self.run(args, None).await.map(|_| ())
    }

    async fn pull(&self, repo_path: &Path) -> Result<()> {
        self.run(&["pull".to_string()], Some(repo_path))
            .await
            .map(|_| ())
    }

    async fn current_branch(&self, repo_path: &Path) -> Result<String> {
        let args = [
            "rev-parse".to_string(),
            "--abbrev-ref".to_string(),
            "HEAD".to_string(),
        ];
        Ok(self.run(&args, Some(repo_path)).await?.trim().to_string())
    }
}

/// Runs git inside a remote sandbox through the sandbox API.
#[derive(Clone)]
pub struct SandboxGit {
    api: Arc<dyn SandboxApi>,
    sandbox_id: String,
}

impl SandboxGit {
    pub fn new(api: Arc<dyn SandboxApi>, sandbox_id: impl Into<String>) -> Self {
        Self {
            api,
            sandbox_id: sandbox_id.into(),
        }
    }

    async fn exec(&self, command: String, cwd: Option<&Path>) -> Result<String> {
        let cwd = cwd.map(|p| p.to_string_lossy().into_owned());
        let response = self
            .api
            .execute_command(&self.sandbox_id, &command, cwd.as_deref())
            .await?;
        if !response.success() {
            return Err(Error::Git(format!(
                "`{}` exited with {}: {}",
                command,
                response.exit_code,
                response.result.trim()
            )));
        }
        Ok(response.result)
    }
}

#[async_trait]
impl GitBackend for SandboxGit {
    async fn prepare(&self, base_dir: &Path) -> Result<()> {
        self.api
            .create_folder(&self.sandbox_id, &base_dir.to_string_lossy(), "755")
            .await
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(false);
        };
        let entries = self
            .api
            .list_files(&self.sandbox_id, &parent.to_string_lossy())
            .await?;
        let name = name.to_string_lossy();
        Ok(entries.iter().any(|e| e.is_dir && e.name == name))
    }

    async fn clone_repo(&self, args: &[String]) -> Result<()> {
        self.exec(format!("git {}", shell_join(args)), None)
            .await
            .map(|_| ())
    }

    async fn pull(&self, repo_path: &Path) -> Result<()> {
        self.exec("git pull".to_string(), Some(repo_path))
            .await
            .map(|_| ())
    }

    async fn current_branch(&self, repo_path: &Path) -> Result<String> {
        Ok(self
            .exec("git rev-parse --abbrev-ref HEAD".to_string(), Some(repo_path))
            .await?
            .trim()
            .to_string())
    }
}
