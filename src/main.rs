//! Hookgate CLI entry point.

use clap::Parser;

use hookgate::cli::{self, Cli, Commands};
use hookgate::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli.command, cli.config.as_deref(), cli.json).await;
    if let Err(err) = result {
        cli::handle_error(err, cli.json);
    }
}

async fn run(
    command: Commands,
    config_path: Option<&std::path::Path>,
    json: bool,
) -> anyhow::Result<()> {
    let config = cli::load_config(config_path)?;
    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))?;

    match command {
        Commands::Validate => cli::commands::validate::execute(config, json),
        Commands::Capabilities => cli::commands::capabilities::execute(config, json),
        Commands::Dispatch { event, repeat, batch } => {
            cli::commands::dispatch::execute(config, &event, repeat, batch, json).await
        }
        Commands::Health { event } => {
            cli::commands::health::execute(config, event.as_deref(), json).await
        }
    }
}
