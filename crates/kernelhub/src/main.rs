use clap::Parser;
use eyre::Result;

use kernelhub::cli::{Cli, Commands};
use kernelhub::commands::{Command, run::RunCommand, serve::ServeCommand};
use kernelhub_core::GatewayConfig;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    kernelhub::cli::config::load_env()?;

    let config = GatewayConfig::load(cli.config.as_deref())?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = kernelhub_core::utils::tracing::init_tracing(&config.logging)?;
    debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Serve { bind, port } => ServeCommand { config, bind, port }.execute().await,
        Commands::Run {
            file,
            timeout,
            json,
        } => {
            RunCommand {
                config,
                file,
                timeout,
                json,
            }
            .execute()
            .await
        }
    }
}
