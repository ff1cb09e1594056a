//! Synergy relay entry point.

use std::process::ExitCode;

use synergy_relay::{RelayConfig, init_tracing, run};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = match RelayConfig::from_env() {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Relay exited with error");
            ExitCode::FAILURE
        }
    }
}
