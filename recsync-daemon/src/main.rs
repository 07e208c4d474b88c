mod commands;
mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use recsync_protocol::RecorderClient;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_from(&config_path).context("Failed to load configuration")?;
    debug!("Loaded configuration from {}", config_path.display());

    if let Command::DumpConfig = cli.command {
        return commands::dump_config(&config);
    }

    let transport = commands::build_transport(&config, cli.simulate)?;
    let client = RecorderClient::spawn(transport, config.engine_config());

    let result = match &cli.command {
        Command::Status => commands::status(&client).await,
        Command::List { json } => commands::list(&client, *json).await,
        Command::Download { name, output } => {
            let output_dir = output
                .clone()
                .unwrap_or_else(|| config.paths.download_dir.clone());
            commands::download(&client, name, &output_dir)
                .await
                .map(|_| ())
        }
        Command::Watch => commands::watch(&client).await,
        Command::DumpConfig => Ok(()),
    };

    if let Err(e) = client.disconnect().await {
        debug!("Disconnect: {}", e);
    }
    if let Err(e) = client.shutdown().await {
        warn!("Client did not shut down cleanly: {}", e);
    }
    match &result {
        Ok(()) => info!("Done"),
        Err(e) => error!("{:#}", e),
    }

    result
}
