//! HTTP server that creates a sandbox per `POST /sandbox/{name}`.

use std::net::SocketAddr;
use std::process::ExitCode;

use docs_sandbox::config::{ExitPolicy, Settings, Validate};
use docs_sandbox::flow::{shutdown_signal, FlowOptions};
use docs_sandbox::logging::{self, LogConfig};
use docs_sandbox::server::{self, AppState};
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

    let state = AppState::new(
        settings.sandbox_api()?,
        settings.registry.clone(),
        FlowOptions::http(settings),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server_port));

    server::serve(addr, state, shutdown_signal()).await
}
