//! Writes the agent configuration into the local volume and syncs the
//! context repos next to it.

use std::process::ExitCode;

use docs_sandbox::config::{ExitPolicy, Settings, Validate};
use docs_sandbox::local::LocalVolume;
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

    let volume = LocalVolume::new(&settings.volume_root, settings.context_registry()?);
    volume.prepare().await?;
    Ok(())
}
