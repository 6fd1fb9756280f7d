use anyhow::{Context, Result};
use clap::Parser;

use flowmatic_core::FlowmaticConfig;
use flowmatic_daemon::cli::DaemonCli;
use flowmatic_daemon::logging;
use flowmatic_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    // File + environment, then command-line overrides on top
    let mut config = FlowmaticConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    config.apply_env_overrides();
    cli.apply_overrides(&mut config);
    config.validate().context("config validation failed")?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "flowmatic-daemon starting"
    );

    let orchestrator = Orchestrator::build_from_config(config).await?;
    let report = orchestrator.run().await?;

    tracing::info!(
        frames_read = report.frames_read,
        cancelled = report.cancelled,
        "flowmatic-daemon shut down"
    );
    Ok(())
}
