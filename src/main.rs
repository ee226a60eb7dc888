//! magicproxy: authenticating API proxy with capability-scoped magic tokens.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use magicproxy::cli::{Cli, Command};
use magicproxy::config::Config;
use magicproxy::gateway::Gateway;
use magicproxy::{keygen, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(Command::GenerateKeys) = cli.command {
        return match keygen::generate_keys(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Key generation failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_root = %config.api_root,
        port = config.server.port,
        "Starting magicproxy"
    );

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    info!("magicproxy shutdown complete");
    ExitCode::SUCCESS
}
