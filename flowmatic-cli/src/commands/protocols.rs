//! `flowmatic protocols` command handler

use std::io::Write;

use serde::Serialize;

use flowmatic_engine::{Engine, EngineConfig, ProtocolInfo};

use crate::cli::ProtocolsArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `protocols` command.
pub fn execute(args: ProtocolsArgs, writer: &OutputWriter) -> Result<(), CliError> {
    let engine = Engine::new(EngineConfig::default())?;
    let report = build_report(&engine, args.name.as_deref())?;
    writer.render(&report)?;
    Ok(())
}

/// Build the report from an engine's registries.
///
/// With `name`, only that protocol is listed and helpers, targets and
/// parameters are omitted.
pub fn build_report(engine: &Engine, name: Option<&str>) -> Result<ProtocolReport, CliError> {
    let protocols: Vec<ProtocolEntry> = engine
        .list_protocols()
        .into_iter()
        .filter(|p| !p.id.is_undefined())
        .filter(|p| name.is_none_or(|n| p.name == n))
        .map(ProtocolEntry::from)
        .collect();

    if let Some(name) = name {
        if protocols.is_empty() {
            return Err(CliError::Command(format!("unknown protocol '{name}'")));
        }
        return Ok(ProtocolReport {
            protocols,
            helpers: Vec::new(),
            targets: Vec::new(),
            params: Vec::new(),
        });
    }

    let mut targets = engine.targets().kinds();
    targets.sort_unstable();

    Ok(ProtocolReport {
        protocols,
        helpers: engine.helper_names(),
        targets,
        params: engine
            .list_params()
            .into_iter()
            .map(|p| ParamEntry {
                name: p.name,
                kind: p.kind.to_string(),
                value: p.value.to_string(),
                default: p.default.to_string(),
                description: p.description,
            })
            .collect(),
    })
}

#[derive(Serialize)]
pub struct ProtocolReport {
    pub protocols: Vec<ProtocolEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub helpers: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamEntry>,
}

#[derive(Serialize)]
pub struct ProtocolEntry {
    pub id: u16,
    pub name: &'static str,
    /// Whether the protocol participates in connection tracking.
    pub conntrack: bool,
    pub fields: Vec<FieldEntry>,
}

#[derive(Serialize)]
pub struct FieldEntry {
    pub name: &'static str,
    pub kind: String,
    pub description: &'static str,
}

#[derive(Serialize)]
pub struct ParamEntry {
    pub name: &'static str,
    pub kind: String,
    pub value: String,
    pub default: String,
    pub description: &'static str,
}

impl From<ProtocolInfo> for ProtocolEntry {
    fn from(info: ProtocolInfo) -> Self {
        Self {
            id: info.id.raw(),
            name: info.name,
            conntrack: info.conntrack,
            fields: info
                .fields
                .iter()
                .map(|f| FieldEntry {
                    name: f.name,
                    kind: f.kind.to_string(),
                    description: f.description,
                })
                .collect(),
        }
    }
}

impl Render for ProtocolReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Protocols ({})", self.protocols.len().to_string().bold())?;
        for p in &self.protocols {
            writeln!(w)?;
            let tag = if p.conntrack { " [conntrack]" } else { "" };
            writeln!(w, "  {}{}", p.name.bold(), tag.cyan())?;
            if p.fields.is_empty() {
                writeln!(w, "    (no fields)")?;
            }
            for f in &p.fields {
                writeln!(w, "    {:<10} {:<8} {}", f.name, f.kind, f.description)?;
            }
        }

        if !self.helpers.is_empty() {
            writeln!(w)?;
            writeln!(w, "Helpers: {}", self.helpers.join(", "))?;
        }
        if !self.targets.is_empty() {
            writeln!(w, "Targets: {}", self.targets.join(", "))?;
        }
        if !self.params.is_empty() {
            writeln!(w)?;
            writeln!(w, "Parameters:")?;
            for p in &self.params {
                writeln!(
                    w,
                    "  {:<20} {:<8} {:<6} {}",
                    p.name, p.value, p.kind, p.description
                )?;
            }
        }

        Ok(())
    }
}
