use anyhow::Context;
use clap::Parser;
use rosterd::cli::{self, Cli, Commands};
use rosterd::config::AppConfig;
use rosterd::supervisor::BotSupervisor;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    match cli.command {
        None | Some(Commands::Run) => {
            init_logging(&config.logging);
            if let Err(errors) = config.validate() {
                for e in &errors {
                    error!("Invalid configuration: {}", e);
                }
                anyhow::bail!("{} configuration error(s)", errors.len());
            }

            info!("Starting rosterd");
            let supervisor = BotSupervisor::connect(config).await?;
            supervisor.run().await?;
            info!("rosterd stopped");
        }
        Some(Commands::Status { json }) => {
            init_logging_simple();
            cli::show_status(&config, json).await?;
        }
        Some(Commands::Queue(cmd)) => {
            init_logging_simple();
            cli::run_queue_command(&config, cmd).await?;
        }
        Some(Commands::Lock(cmd)) => {
            init_logging_simple();
            cli::run_lock_command(&config, cmd).await?;
        }
    }

    Ok(())
}
