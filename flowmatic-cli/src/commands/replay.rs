//! `flowmatic replay` command handler
//!
//! Runs a pcap capture through a fresh engine loaded with the configured
//! rules and reports per-rule counters, target status and, optionally,
//! the flows left in the connection tracking table.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use flowmatic_core::FlowmaticConfig;
use flowmatic_engine::{
    Engine, EngineConfig, EngineStats, FlowSummary, PcapFileInput, RuleInfo, RuleLoader, Runner,
};

use crate::cli::ReplayArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `replay` command.
pub async fn execute(
    args: ReplayArgs,
    config: &FlowmaticConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let report = run_replay(&args, config).await?;
    writer.render(&report)?;
    Ok(())
}

/// Replay a capture and collect the resulting engine state.
pub async fn run_replay(
    args: &ReplayArgs,
    config: &FlowmaticConfig,
) -> Result<ReplayReport, CliError> {
    let engine = Arc::new(Engine::new(EngineConfig::from_core(config))?);

    for param in &args.params {
        let (name, value) = param.split_once('=').ok_or_else(|| {
            CliError::Command(format!("invalid --param '{param}', expected NAME=VALUE"))
        })?;
        engine.set_param(name.trim(), value.trim())?;
    }

    let rules_dir = args
        .rules_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.engine.rules_dir));
    let defs = RuleLoader::load_directory(&rules_dir).await?;
    let added = engine.add_rules(&defs);
    info!(rules_dir = %rules_dir.display(), loaded = defs.len(), added, "rules loaded");

    let input = PcapFileInput::new(&args.capture, config.input.snaplen);
    let runner = Runner::new(Arc::clone(&engine));
    let run = tokio::task::spawn_blocking(move || runner.run(Box::new(input)))
        .await
        .map_err(|e| CliError::Replay(format!("replay task failed: {e}")))?
        .map_err(|e| CliError::Replay(format!("{}: {e}", args.capture.display())))?;

    let rules = engine.list_rules();
    let flows = if args.flows { engine.flows() } else { Vec::new() };
    engine.shutdown();

    Ok(ReplayReport {
        capture: args.capture.display().to_string(),
        frames_read: run.frames_read,
        ring_dropped: run.ring_dropped,
        stats: run.stats,
        rules,
        flows,
    })
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub capture: String,
    pub frames_read: u64,
    pub ring_dropped: u64,
    pub stats: EngineStats,
    pub rules: Vec<RuleInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowSummary>,
}

impl Render for ReplayReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        let s = &self.stats;
        writeln!(w, "Replay: {}", self.capture.bold())?;
        writeln!(w, "  Frames read:       {}", self.frames_read)?;
        writeln!(w, "  Processed:         {}", s.frames_processed)?;
        writeln!(w, "  Claimed:           {}", s.frames_claimed)?;
        writeln!(w, "  Reinjected:        {}", s.frames_reinjected)?;
        writeln!(
            w,
            "  Dropped:           {}",
            if s.frames_dropped > 0 {
                s.frames_dropped.to_string().yellow()
            } else {
                s.frames_dropped.to_string().normal()
            }
        )?;
        writeln!(w, "  Ring overflow:     {}", self.ring_dropped)?;
        writeln!(w, "  Conntrack entries: {}", s.conntrack_entries)?;
        writeln!(w, "  Expectations:      {}", s.expectations)?;
        writeln!(w)?;

        writeln!(w, "{:<20} {:>10} {:>12}  Targets", "Rule", "Packets", "Bytes")?;
        writeln!(w, "{}", "-".repeat(72))?;
        for rule in &self.rules {
            let targets: Vec<String> = rule
                .targets
                .iter()
                .map(|t| {
                    let label = format!("{}{} {}", t.kind, t.id, t.status);
                    if t.errors > 0 {
                        format!("{label} ({} errors)", t.errors).red().to_string()
                    } else {
                        label
                    }
                })
                .collect();
            writeln!(
                w,
                "{:<20} {:>10} {:>12}  {}",
                rule.name,
                rule.packets,
                rule.bytes,
                targets.join(", ")
            )?;
        }

        if !self.flows.is_empty() {
            writeln!(w)?;
            writeln!(w, "{:<10} {:<28} {:<8} {:>14} {:>9}", "Flow", "Protocols", "Dir", "Packets", "Timeout")?;
            writeln!(w, "{}", "-".repeat(72))?;
            for flow in &self.flows {
                let protocols = match flow.parent {
                    Some(parent) => format!("{} (child of {parent})", flow.protocols.join("/")),
                    None => flow.protocols.join("/"),
                };
                writeln!(
                    w,
                    "{:<10} {:<28} {:<8} {:>14} {:>8}s",
                    flow.id.to_string(),
                    protocols,
                    flow.direction.to_string(),
                    format!("{}/{}", flow.packets[0], flow.packets[1]),
                    flow.timeout_secs
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(capture: &str) -> ReplayArgs {
        ReplayArgs {
            capture: PathBuf::from(capture),
            rules_dir: None,
            flows: false,
            params: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_replay_rejects_malformed_param() {
        let mut a = args("/tmp/none.pcap");
        a.params.push("conntrack.default_timeout".to_owned());

        let err = run_replay(&a, &FlowmaticConfig::default()).await.unwrap_err();
        assert!(matches!(err, CliError::Command(_)));
        assert!(err.to_string().contains("NAME=VALUE"));
    }

    #[tokio::test]
    async fn test_replay_unknown_param_is_engine_error() {
        let mut a = args("/tmp/none.pcap");
        a.params.push("no.such.param=1".to_owned());

        let err = run_replay(&a, &FlowmaticConfig::default()).await.unwrap_err();
        assert!(matches!(err, CliError::Engine(_)));
    }

    #[test]
    fn test_empty_report_renders_header() {
        let report = ReplayReport {
            capture: "trace.pcap".to_owned(),
            frames_read: 0,
            ring_dropped: 0,
            stats: EngineStats::default(),
            rules: Vec::new(),
            flows: Vec::new(),
        };
        let mut buffer = Vec::new();
        report.render_text(&mut buffer).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert!(output.contains("trace.pcap"));
        assert!(output.contains("Frames read:"));
        assert!(!output.contains("Protocols"));
    }
}
