mod bootstrap;
mod config;

use std::process::ExitCode;

use clap::Parser;
use config::Config;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::FatalError;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            // clap renders its own message (including --help/--version)
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match bootstrap::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ FatalError::Config(_)) => {
            error!("{}", e);
            ExitCode::from(1)
        }
        Err(e @ FatalError::Runtime(_)) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
