//! Remote sandbox flow.
//!
//! One sequence serves every remote variant: create a sandbox, prepare SSH
//! convenience, upload the agent configuration, sync repos when the image
//! does not carry them, start the documentation server and print how to
//! connect. The variant picks the sandbox source and the repo set.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::repos::{RepoDescriptor, Registry};
use crate::sandbox::{
    CreateSandboxParams, Resources, SandboxApi, SandboxInfo, SandboxSource, SessionExecRequest,
};
use crate::snapshot::runtime_image;
use crate::sync::{report, sync_repos, SandboxGit, SyncOptions, SyncResult};
use crate::template::{BundlePaths, ConfigBundle, Permission, TemplateParams, SANDBOX_MODEL};

/// Configuration and repos live under this directory inside a sandbox.
pub const SANDBOX_VOLUME_ROOT: &str = "/context";

/// Port the documentation server listens on.
pub const SERVER_PORT: u16 = 8080;

/// Starts the documentation server inside a sandbox session.
pub const SERVER_COMMAND: &str = "opencode serve --port=8080 --hostname=0.0.0.0";

pub const BASHRC_PATH: &str = "/root/.bashrc";

/// Appended to the sandbox's bashrc so an SSH login attaches to the server.
pub const BASHRC_ADDON: &str = "\n    echo \"STARTING...\"\n    sleep 2\n    opencode attach http://localhost:8080\n  ";

pub const SSH_HOST: &str = "ssh.app.daytona.io";

/// Lifetime of minted SSH credentials, in minutes.
pub const SSH_ACCESS_MINUTES: u32 = 24;

/// Auto-stop for interactive sandboxes, in minutes.
pub const CLI_AUTO_STOP_MINUTES: u32 = 600;

/// Auto-stop for sandboxes created over HTTP, in minutes.
pub const HTTP_AUTO_STOP_MINUTES: u32 = 120;

/// Delay between starting the server and asking for its preview link.
pub const HTTP_WARMUP: Duration = Duration::from_secs(2);

/// Where the sandbox's filesystem and repos come from.
#[derive(Debug, Clone)]
pub enum Variant {
    /// Prebuilt per-repo snapshot with the checkout baked in.
    Snapshot(RepoDescriptor),
    /// Base image; the listed repos are cloned after creation.
    Image(Registry),
}

impl Variant {
    fn source(&self) -> SandboxSource {
        match self {
            Self::Snapshot(repo) => SandboxSource::Snapshot(repo.snapshot_name()),
            Self::Image(_) => SandboxSource::Image(runtime_image()),
        }
    }

    fn repo_names(&self) -> Vec<String> {
        match self {
            Self::Snapshot(repo) => vec![repo.name.clone()],
            Self::Image(registry) => registry.names().into_iter().map(String::from).collect(),
        }
    }
}

/// Knobs that differ between the remote entry points.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Minutes before an idle sandbox stops. `0` disables auto-stop.
    pub auto_stop_interval: u32,
    pub resources: Option<Resources>,
    /// Leave the sandbox running when the process exits.
    pub run_in_background: bool,
    pub opencode_api_key: String,
    /// Pause after starting the server before fetching its preview link.
    pub warmup: Duration,
    pub ssh_access_minutes: u32,
}

impl FlowOptions {
    /// Interactive sandbox from a snapshot.
    pub fn snapshot(settings: &Settings) -> Self {
        Self {
            auto_stop_interval: CLI_AUTO_STOP_MINUTES,
            resources: None,
            run_in_background: settings.run_in_background,
            opencode_api_key: settings.opencode_api_key.clone(),
            warmup: Duration::ZERO,
            ssh_access_minutes: SSH_ACCESS_MINUTES,
        }
    }

    /// Interactive sandbox built from the base image.
    pub fn image(settings: &Settings) -> Self {
        Self {
            auto_stop_interval: 0,
            resources: Some(settings.resources.image),
            ..Self::snapshot(settings)
        }
    }

    /// Sandbox created per HTTP request. Never deleted by this process.
    pub fn http(settings: &Settings) -> Self {
        Self {
            auto_stop_interval: HTTP_AUTO_STOP_MINUTES,
            run_in_background: true,
            warmup: HTTP_WARMUP,
            ..Self::snapshot(settings)
        }
    }
}

/// How to reach a started server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub url: String,
    pub ssh_token: String,
}

impl ConnectionInfo {
    pub fn ssh_command(&self) -> String {
        format!("ssh {}@{}", self.ssh_token, SSH_HOST)
    }

    pub fn attach_command(&self) -> String {
        format!("opencode attach {}", self.url)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CONNECT WITH SSH: {}", self.ssh_command())?;
        writeln!(f)?;
        write!(f, "CONNECT WITH LOCAL TERMINAL: {}", self.attach_command())
    }
}

/// A created sandbox and the decision whether to delete it.
///
/// [`release`](Self::release) deletes at most once, and never when the lease
/// was created to be kept.
pub struct SandboxLease {
    api: Arc<dyn SandboxApi>,
    info: SandboxInfo,
    keep: bool,
    released: AtomicBool,
}

impl SandboxLease {
    pub fn new(api: Arc<dyn SandboxApi>, info: SandboxInfo, keep: bool) -> Self {
        Self {
            api,
            info,
            keep,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn keeps_sandbox(&self) -> bool {
        self.keep
    }

    /// Deletes the sandbox unless kept or already released.
    ///
    /// Failures are logged and swallowed.
    pub async fn release(&self) {
        if self.keep {
            tracing::info!(sandbox = %self.info.id, "leaving sandbox running");
            return;
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(sandbox = %self.info.id, "cleaning up sandbox");
        if let Err(e) = self.api.delete(&self.info.id).await {
            tracing::error!(sandbox = %self.info.id, error = %e, "failed to delete sandbox");
        }
    }
}

/// Background start of the documentation server.
///
/// A supervised task keeps its session until cancelled, then deletes it. An
/// unsupervised task finishes as soon as the server command is submitted.
pub struct ServerTask {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ServerTask {
    pub fn spawn(api: Arc<dyn SandboxApi>, sandbox_id: impl Into<String>, supervise: bool) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let sandbox_id = sandbox_id.into();

        let handle = tokio::spawn(async move {
            let session_id = Uuid::new_v4().to_string();

            let started = tokio::select! {
                _ = child.cancelled() => None,
                result = start_server(api.as_ref(), &sandbox_id, &session_id) => Some(result),
            };

            match started {
                Some(Ok(())) if !supervise => return Ok(()),
                Some(Ok(())) => child.cancelled().await,
                Some(Err(e)) => {
                    stop_session(api.as_ref(), &sandbox_id, &session_id).await;
                    return Err(e);
                }
                None => tracing::debug!(session = %session_id, "server start cancelled"),
            }

            stop_session(api.as_ref(), &sandbox_id, &session_id).await;
            Ok(())
        });

        Self { token, handle }
    }

    /// Requests the task to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the task to end.
    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::sandbox("start server", e))?
    }

    /// Resolves when the task ends on its own. A supervised task only does
    /// so on failure.
    async fn finished(&mut self) -> Result<()> {
        (&mut self.handle)
            .await
            .map_err(|e| Error::sandbox("start server", e))?
    }
}

async fn start_server(api: &dyn SandboxApi, sandbox_id: &str, session_id: &str) -> Result<()> {
    api.create_session(sandbox_id, session_id)
        .await
        .map_err(|e| Error::sandbox("start server", e))?;

    let command = api
        .execute_session_command(
            sandbox_id,
            session_id,
            SessionExecRequest {
                command: SERVER_COMMAND.to_string(),
                run_async: true,
            },
        )
        .await
        .map_err(|e| Error::sandbox("start server", e))?;

    if let Some(cmd_id) = command.cmd_id {
        let output = api
            .session_command_logs(sandbox_id, session_id, &cmd_id)
            .await
            .map_err(|e| Error::sandbox("start server", e))?;
        tracing::info!(session = %session_id, command = %cmd_id, output = %output.trim(), "server started");
    }
    Ok(())
}

async fn stop_session(api: &dyn SandboxApi, sandbox_id: &str, session_id: &str) {
    if let Err(e) = api.delete_session(sandbox_id, session_id).await {
        tracing::warn!(session = %session_id, error = %e, "failed to stop server session");
    }
}

/// The remote sandbox flow for one variant.
pub struct SandboxFlow {
    api: Arc<dyn SandboxApi>,
    variant: Variant,
    options: FlowOptions,
}

impl SandboxFlow {
    pub fn new(api: Arc<dyn SandboxApi>, variant: Variant, options: FlowOptions) -> Self {
        Self {
            api,
            variant,
            options,
        }
    }

    pub fn create_params(&self) -> CreateSandboxParams {
        let volume = Path::new(SANDBOX_VOLUME_ROOT);
        let mut env_vars = HashMap::new();
        env_vars.insert(
            "OPENCODE_CONFIG".to_string(),
            volume.join(crate::template::CONFIG_FILE).to_string_lossy().into_owned(),
        );
        env_vars.insert(
            "OPENCODE_API_KEY".to_string(),
            self.options.opencode_api_key.clone(),
        );

        CreateSandboxParams {
            source: self.variant.source(),
            env_vars,
            public: true,
            auto_stop_interval: self.options.auto_stop_interval,
            resources: self.options.resources,
        }
    }

    pub fn template_params(&self) -> TemplateParams {
        TemplateParams {
            repos_dir: Path::new(SANDBOX_VOLUME_ROOT).join("repos"),
            repo_names: self.variant.repo_names(),
            model: Some(SANDBOX_MODEL.to_string()),
            docs_bash: Permission::Allow,
        }
    }

    /// Creates the sandbox. `keep` overrides the background option.
    pub async fn create_sandbox(&self, keep: bool) -> Result<SandboxLease> {
        match &self.variant {
            Variant::Snapshot(repo) => {
                tracing::info!(snapshot = %repo.snapshot_name(), "creating sandbox from snapshot")
            }
            Variant::Image(_) => tracing::info!("creating sandbox from image"),
        }

        let info = self
            .api
            .create(self.create_params())
            .await
            .map_err(|e| Error::sandbox("create sandbox", e))?;
        tracing::info!(sandbox = %info.id, "sandbox created");

        Ok(SandboxLease::new(
            Arc::clone(&self.api),
            info,
            keep || self.options.run_in_background,
        ))
    }

    /// Uploads `opencode.json` and the prompts under the volume root.
    pub async fn setup_config(&self, sandbox_id: &str) -> Result<BundlePaths> {
        tracing::info!("setting up config");
        let bundle = ConfigBundle::render(&self.template_params())?;
        let paths = bundle
            .upload_to_sandbox(self.api.as_ref(), sandbox_id, Path::new(SANDBOX_VOLUME_ROOT))
            .await?;
        tracing::info!(path = ?paths.config, "config written");
        tracing::info!(path = ?paths.docs_prompt, "docs agent prompt written");
        tracing::info!(path = ?paths.ask_prompt, "ask agent prompt written");
        Ok(paths)
    }

    /// Makes SSH logins attach to the running server.
    pub async fn setup_ssh_access(&self, sandbox_id: &str) -> Result<()> {
        tracing::info!("preparing ssh access");
        let mut bashrc = self
            .api
            .download_file(sandbox_id, BASHRC_PATH)
            .await
            .map_err(|e| Error::sandbox("download .bashrc", e))?;
        bashrc.extend_from_slice(BASHRC_ADDON.as_bytes());
        self.api
            .upload_file(sandbox_id, BASHRC_PATH, bashrc)
            .await
            .map_err(|e| Error::sandbox("upload .bashrc", e))?;
        tracing::info!("ssh access prepared");
        Ok(())
    }

    /// Clones or pulls the image variant's repos inside the sandbox.
    ///
    /// Snapshot sandboxes already carry their checkout and sync nothing.
    pub async fn sync_context_repos(&self, sandbox_id: &str) -> Result<Vec<SyncResult>> {
        let Variant::Image(registry) = &self.variant else {
            return Ok(Vec::new());
        };

        tracing::info!("syncing context repos");
        let backend = Arc::new(SandboxGit::new(Arc::clone(&self.api), sandbox_id));
        let results = sync_repos(
            backend,
            registry.repos(),
            &Path::new(SANDBOX_VOLUME_ROOT).join("repos"),
            &SyncOptions::default(),
        )
        .await
        .map_err(|e| Error::sandbox("create repos folder", e))?;
        report(&results);
        Ok(results)
    }

    pub fn start_server(&self, sandbox_id: &str, supervise: bool) -> ServerTask {
        tracing::info!("starting server");
        ServerTask::spawn(Arc::clone(&self.api), sandbox_id, supervise)
    }

    /// Fetches the preview URL and mints an SSH credential.
    pub async fn connection_info(&self, sandbox_id: &str) -> Result<ConnectionInfo> {
        let preview = self
            .api
            .preview_link(sandbox_id, SERVER_PORT)
            .await
            .map_err(|e| Error::sandbox("get preview link", e))?;
        let ssh = self
            .api
            .create_ssh_access(sandbox_id, self.options.ssh_access_minutes)
            .await
            .map_err(|e| Error::sandbox("create ssh access", e))?;

        Ok(ConnectionInfo {
            url: preview.url,
            ssh_token: ssh.token,
        })
    }

    /// Runs the interactive flow until `shutdown` resolves.
    ///
    /// In background mode the flow returns once connection details are
    /// printed and the sandbox is left running. Otherwise the sandbox is
    /// deleted exactly once on the way out, whether the flow failed or was
    /// interrupted.
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let lease = tokio::select! {
            lease = self.create_sandbox(false) => lease?,
            _ = &mut shutdown => {
                tracing::info!("shutdown requested before sandbox was created");
                return Ok(());
            }
        };

        let result = self.serve(&lease, shutdown.as_mut()).await;
        lease.release().await;
        result
    }

    async fn serve<F>(&self, lease: &SandboxLease, mut shutdown: std::pin::Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let id = lease.id();

        let setup = async {
            self.setup_ssh_access(id).await?;
            self.setup_config(id).await?;
            self.sync_context_repos(id).await?;
            Ok::<_, Error>(())
        };
        tokio::select! {
            result = setup => result?,
            _ = shutdown.as_mut() => {
                tracing::info!("shutdown requested during setup");
                return Ok(());
            }
        }

        let mut server = self.start_server(id, !lease.keeps_sandbox());
        if !self.options.warmup.is_zero() {
            tokio::time::sleep(self.options.warmup).await;
        }

        let info = match self.connection_info(id).await {
            Ok(info) => info,
            Err(e) => {
                server.cancel();
                if let Err(server_err) = server.join().await {
                    tracing::warn!(sandbox = %id, error = %server_err, "server task failed while stopping");
                }
                return Err(e);
            }
        };
        tracing::info!(url = %info.url, "server started");
        println!("\n{}\n", info);

        if lease.keeps_sandbox() {
            return server.join().await;
        }

        let failed = tokio::select! {
            _ = shutdown.as_mut() => None,
            result = server.finished() => Some(result),
        };
        match failed {
            Some(result) => result,
            None => {
                tracing::info!("shutdown requested");
                server.cancel();
                server.join().await
            }
        }
    }

    /// Creates a sandbox, configures it and starts the server without
    /// waiting for shutdown. The sandbox outlives the call and is reclaimed
    /// by auto-stop; it is deleted only if setup fails.
    pub async fn create_and_start(&self) -> Result<ConnectionInfo> {
        let lease = self.create_sandbox(true).await?;
        let id = lease.id().to_string();

        let result = async {
            self.setup_config(&id).await?;
            self.sync_context_repos(&id).await?;
            self.start_server(&id, false).join().await?;
            tokio::time::sleep(self.options.warmup).await;
            self.connection_info(&id).await
        }
        .await;

        match result {
            Ok(info) => {
                tracing::info!(sandbox = %id, url = %info.url, "sandbox ready");
                Ok(info)
            }
            Err(e) => {
                tracing::error!(sandbox = %id, error = %e, "sandbox setup failed");
                if let Err(delete_err) = self.api.delete(&id).await {
                    tracing::error!(sandbox = %id, error = %delete_err, "failed to delete sandbox");
                }
                Err(e)
            }
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
