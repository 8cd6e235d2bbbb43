//! Builds the snapshot for `SNAPSHOT_REPO`.
//!
//! Exits non-zero on failure unless `EXIT_POLICY=clean`.

use std::process::ExitCode;

use docs_sandbox::config::{ExitPolicy, Settings, Validate};
use docs_sandbox::logging::{self, LogConfig};
use docs_sandbox::snapshot::build_snapshot;
use docs_sandbox::{Error, Result};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = logging::init(&LogConfig::default()) {
        eprintln!("{e}");
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => return ExitPolicy::Strict.exit_code(&Err(e)),
    };
    let policy = settings.exit_policy_or(ExitPolicy::Strict);
    policy.exit_code(&run(&settings).await)
}

async fn run(settings: &Settings) -> Result<()> {
    settings.validate().into_result()?;

    let name = settings
        .snapshot_repo
        .as_deref()
        .ok_or_else(|| Error::Config("SNAPSHOT_REPO is not set".to_string()))?;
    let repo = settings.registry.require(name)?;
    let api = settings.sandbox_api()?;

    build_snapshot(api.as_ref(), repo, settings.resources.snapshot).await?;
    Ok(())
}
