//! Runs the documentation server against the local volume.

use std::process::ExitCode;

use docs_sandbox::config::{ExitPolicy, Settings};
use docs_sandbox::flow::{shutdown_signal, SERVER_PORT};
use docs_sandbox::local::{LocalServer, LocalVolume};
use docs_sandbox::logging::{self, LogConfig};
use docs_sandbox::Result;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = logging::init(&LogConfig::default()) {
        eprintln!("{e}");
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => return ExitPolicy::Clean.exit_code(&Err(e)),
    };
    let policy = settings.exit_policy_or(ExitPolicy::Clean);
    policy.exit_code(&run(&settings).await)
}

async fn run(settings: &Settings) -> Result<()> {
    let volume = LocalVolume::new(&settings.volume_root, settings.context_registry()?);
    if !volume.config_path().is_file() {
        tracing::warn!(
            path = ?volume.config_path(),
            "no config in volume, run docs-sandbox-prepare first"
        );
    }

    let server = LocalServer::new(&settings.opencode_bin, SERVER_PORT);
    if let Some(status) = server.run_until_shutdown(&volume, shutdown_signal()).await? {
        tracing::warn!(%status, "server stopped on its own");
    }
    Ok(())
}
