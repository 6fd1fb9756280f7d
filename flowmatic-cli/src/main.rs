//! flowmatic -- offline companion to the flowmatic daemon
//!
//! Lists the built-in protocols, validates rule files and expressions,
//! replays pcap captures through the engine and inspects configuration.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use flowmatic_cli::cli::{Cli, Commands};
use flowmatic_cli::commands;
use flowmatic_cli::error::CliError;
use flowmatic_cli::output::OutputWriter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays parseable in JSON mode.
    let level = cli.log_level.as_deref().unwrap_or("warn");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let writer = OutputWriter::new(cli.output);

    if let Err(e) = run(cli, &writer).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli, writer: &OutputWriter) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Protocols(args) => commands::protocols::execute(args, writer),
        Commands::Config(args) => commands::config::execute(args, config_path, writer).await,
        Commands::Rules(args) => {
            let config = commands::load_config(config_path).await?;
            commands::rules::execute(args, &config, writer).await
        }
        Commands::Replay(args) => {
            let config = commands::load_config(config_path).await?;
            commands::replay::execute(args, &config, writer).await
        }
    }
}
