//! Interactive documentation sandbox created from a per-repo snapshot.
//!
//! Picks the repo from `SANDBOX_REPO` (default `opencode`), prints SSH and
//! attach commands, and deletes the sandbox on Ctrl-C unless
//! `RUN_IN_BACKGROUND=true`.

use std::process::ExitCode;

use docs_sandbox::config::{ExitPolicy, Settings, Validate};
use docs_sandbox::flow::{shutdown_signal, FlowOptions, SandboxFlow, Variant};
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
    settings.validate().into_result()?;

    let repo = settings.registry.require(&settings.sandbox_repo)?.clone();
    let api = settings.sandbox_api()?;

    SandboxFlow::new(api, Variant::Snapshot(repo), FlowOptions::snapshot(settings))
        .run_until_shutdown(shutdown_signal())
        .await
}
