//! CLI argument parsing using clap derive API
//!
//! This module defines the command-line interface structure using clap's derive macros.
//! It is purely declarative with no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Flowmatic -- packet classification and connection tracking.
///
/// Use `flowmatic <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "flowmatic", version, about, long_about = None)]
pub struct Cli {
    /// Path to a flowmatic.toml configuration file (defaults apply when omitted).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table / text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered protocols and their fields.
    Protocols(ProtocolsArgs),

    /// Inspect and validate rules.
    Rules(RulesArgs),

    /// Replay a capture file through a rule set and print a summary.
    Replay(ReplayArgs),

    /// Manage configuration.
    Config(ConfigArgs),
}

// ---- protocols ----

/// List protocols, helpers, targets and parameters.
#[derive(Args, Debug)]
pub struct ProtocolsArgs {
    /// Show only this protocol.
    pub name: Option<String>,
}

// ---- rules ----

/// Inspect and validate rules.
#[derive(Args, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub action: RulesAction,
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List the rules found in a rules directory.
    List {
        /// Rules directory (default: engine.rules_dir from the configuration).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Validate rule files: YAML syntax, match expression, and target options.
    Validate {
        /// A rule file or a directory of `.yml`/`.yaml` files.
        #[arg(default_value = "/etc/flowmatic/rules")]
        path: PathBuf,
    },
    /// Check a single match expression.
    Check {
        /// Expression, e.g. "ethernet | ipv4 | udp.dport == 53".
        expression: String,
    },
}

// ---- replay ----

/// Replay a pcap/pcapng file offline.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Capture file to read.
    pub capture: PathBuf,

    /// Rules directory (default: engine.rules_dir from the configuration).
    #[arg(short, long)]
    pub rules_dir: Option<PathBuf>,

    /// Include the connections still tracked at the end of the capture.
    #[arg(long)]
    pub flows: bool,

    /// Set a runtime parameter before replaying (repeatable), e.g. `ipv4.frag_timeout=30`.
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,
}

// ---- config ----

/// Manage flowmatic configuration.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Show only a specific section (general, input, engine, helpers, metrics).
        #[arg(long)]
        section: Option<String>,
    },
}
