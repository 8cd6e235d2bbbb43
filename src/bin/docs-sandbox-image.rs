//! Interactive documentation sandbox built from the base image.
//!
//! The context repos are cloned inside the sandbox after it starts.

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

    let variant = Variant::Image(settings.image_registry()?);
    let api = settings.sandbox_api()?;

    SandboxFlow::new(api, variant, FlowOptions::image(settings))
        .run_until_shutdown(shutdown_signal())
        .await
}
