//! CLI argument definitions for flowmatic-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use flowmatic_core::FlowmaticConfig;

/// Flowmatic packet classification daemon.
///
/// Reads frames from the configured input, classifies them against the
/// loaded rule set and tracks connections until the input ends or a
/// shutdown signal arrives. `SIGHUP` is forwarded to every target.
#[derive(Parser, Debug)]
#[command(name = "flowmatic-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to flowmatic.toml configuration file.
    #[arg(short, long, default_value = "/etc/flowmatic/flowmatic.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override the capture file to read (input.path).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Override the rules directory (engine.rules_dir).
    #[arg(long)]
    pub rules_dir: Option<PathBuf>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Apply command-line overrides on top of the loaded configuration.
    ///
    /// The caller must validate the configuration again afterwards.
    pub fn apply_overrides(&self, config: &mut FlowmaticConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.general.log_format.clone_from(format);
        }
        if let Some(path) = &self.pid_file {
            config.general.pid_file.clone_from(path);
        }
        if let Some(input) = &self.input {
            config.input.path = input.display().to_string();
        }
        if let Some(dir) = &self.rules_dir {
            config.engine.rules_dir = dir.display().to_string();
        }
    }
}
